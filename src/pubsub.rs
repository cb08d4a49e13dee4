use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

impl SubscriptionKind {
    pub(crate) fn subscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Message,
    PMessage,
    SMessage,
}

/// One published message delivered to a subscription sink.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub channel: String,
    /// The matching pattern, for `pmessage` deliveries.
    pub pattern: Option<String>,
    pub payload: Bytes,
}

/// Registry entry for one channel or pattern. Created on the outbound
/// subscribe, activated by the server's ack, removed when the matching
/// unsubscribe ack arrives or the connection closes.
pub(crate) struct Subscription {
    pub(crate) name: String,
    pub(crate) kind: SubscriptionKind,
    // One sender per attached consumer; deliveries fan out to all of them.
    // Dropping the entry closes every sink, so consumers observe a clean
    // end-of-stream.
    pub(crate) sinks: Vec<UnboundedSender<Message>>,
    // One ack is expected per outstanding subscribe command naming this
    // entry; acks resolve in arrival order with the server's running count.
    pub(crate) pending_acks: VecDeque<oneshot::Sender<i64>>,
}

impl Subscription {
    pub(crate) fn new(name: String, kind: SubscriptionKind) -> Subscription {
        Subscription {
            name,
            kind,
            sinks: Vec::new(),
            pending_acks: VecDeque::new(),
        }
    }

    pub(crate) fn deliver(&mut self, message: Message) {
        self.sinks.retain(|sink| sink.send(message.clone()).is_ok());
    }
}

/// Consumer handle returned by subscribe calls. Messages arrive in the order
/// they were decoded from the wire; `recv` returns `None` once the
/// subscription is torn down.
pub struct Subscriber {
    pub(crate) receiver: UnboundedReceiver<Message>,
}

impl Subscriber {
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn deliver_fans_out_to_every_sink() {
        let mut subscription = Subscription::new("news".to_string(), SubscriptionKind::Channel);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        subscription.sinks.push(tx_a);
        subscription.sinks.push(tx_b);

        let message = Message {
            kind: MessageKind::Message,
            channel: "news".to_string(),
            pattern: None,
            payload: Bytes::from("hello"),
        };
        subscription.deliver(message.clone());

        assert_eq!(rx_a.try_recv().unwrap(), message);
        assert_eq!(rx_b.try_recv().unwrap(), message);
    }

    #[test]
    fn deliver_prunes_closed_sinks() {
        let mut subscription = Subscription::new("news".to_string(), SubscriptionKind::Channel);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        subscription.sinks.push(tx);

        subscription.deliver(Message {
            kind: MessageKind::Message,
            channel: "news".to_string(),
            pattern: None,
            payload: Bytes::from("hello"),
        });

        assert!(subscription.sinks.is_empty());
    }
}
