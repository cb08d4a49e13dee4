use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use crate::command::Command;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::{Error, Result};

/// Command surface handed to a `multi` body. Commands issued through it are
/// queued server-side; their replies materialize when `EXEC` distributes its
/// reply array.
#[derive(Clone)]
pub struct MultiHandle {
    connection: Connection,
    queued: Arc<Mutex<Vec<oneshot::Sender<Result<Frame>>>>>,
    discarded: Arc<AtomicBool>,
}

/// Deferred reply of one queued command. Resolves after `EXEC`.
pub struct QueuedReply {
    receiver: oneshot::Receiver<Result<Frame>>,
}

impl QueuedReply {
    pub async fn reply(self) -> Result<Frame> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

impl MultiHandle {
    pub async fn execute(&self, command: Command) -> Result<QueuedReply> {
        // The wire reply here is the +QUEUED ack; the command's real reply
        // arrives as its slot of the EXEC array.
        let ack = self.connection.execute_internal(command).await?;
        debug!(ack = %ack, "command queued in transaction");

        let (tx, rx) = oneshot::channel();
        self.queued.lock().unwrap().push(tx);
        Ok(QueuedReply { receiver: rx })
    }

    /// Abandons the session: `DISCARD` is issued after the body returns and
    /// every queued reply fails with the discard error.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::SeqCst);
    }
}

impl Connection {
    /// Runs `body` inside a MULTI/EXEC session. Sessions on one connection
    /// serialize in call order, and non-transactional commands issued while
    /// sessions are queued wait for them to finish.
    ///
    /// Resolves to the counts of queued commands that succeeded and failed.
    pub async fn multi<F, Fut>(&self, body: F) -> Result<(usize, usize)>
    where
        F: FnOnce(MultiHandle) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (barrier, earlier) = self.register_multi_barrier();
        for mut session in earlier {
            let _ = session.wait_for(|done| *done).await;
        }

        let result = self.run_session(body).await;

        // Successors unblock even when the session failed.
        barrier.send_replace(true);
        result
    }

    async fn run_session<F, Fut>(&self, body: F) -> Result<(usize, usize)>
    where
        F: FnOnce(MultiHandle) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.execute_internal(Command::new("MULTI")).await?;

        let handle = MultiHandle {
            connection: self.clone(),
            queued: Arc::new(Mutex::new(Vec::new())),
            discarded: Arc::new(AtomicBool::new(false)),
        };
        let queued_slots = handle.queued.clone();
        let discarded = handle.discarded.clone();

        let body_result = body(handle).await;
        let queued = std::mem::take(&mut *queued_slots.lock().unwrap());

        if body_result.is_err() || discarded.load(Ordering::SeqCst) {
            let message = match &body_result {
                Err(e) => format!("transaction discarded: {}", e),
                Ok(()) => "transaction discarded".to_string(),
            };
            // Best effort: the queued replies fail with the discard error
            // whether or not DISCARD itself goes through.
            let _ = self.execute_internal(Command::new("DISCARD")).await;
            let failures = queued.len();
            for slot in queued {
                let _ = slot.send(Err(Error::redis(message.clone())));
            }
            return match body_result {
                Err(e) => Err(e),
                Ok(()) => Ok((0, failures)),
            };
        }

        let reply = match self.execute_internal(Command::new("EXEC")).await {
            Ok(reply) => reply,
            Err(e) => {
                let message = e.to_string();
                for slot in queued {
                    let _ = slot.send(Err(Error::redis(message.clone())));
                }
                return Err(e);
            }
        };

        match reply {
            // One element per queued command, in submission order.
            Frame::Array(items) => {
                let mut successes = 0;
                let mut failures = 0;
                let mut items = items.into_iter();
                for slot in queued {
                    match items.next() {
                        Some(Frame::Error(message)) => {
                            failures += 1;
                            let _ = slot.send(Err(Error::redis(message)));
                        }
                        Some(frame) => {
                            successes += 1;
                            let _ = slot.send(Ok(frame));
                        }
                        None => {
                            failures += 1;
                            let _ = slot.send(Err(Error::Protocol(
                                "EXEC reply was shorter than the queue".to_string(),
                            )));
                        }
                    }
                }
                Ok((successes, failures))
            }
            // Nil EXEC means the server aborted the transaction.
            Frame::Null => {
                let failures = queued.len();
                for slot in queued {
                    let _ = slot.send(Err(Error::redis("transaction aborted by the server")));
                }
                Ok((0, failures))
            }
            other => {
                let message = format!("unexpected EXEC reply: {}", other);
                for slot in queued {
                    let _ = slot.send(Err(Error::Protocol(message.clone())));
                }
                Err(Error::Protocol(message))
            }
        }
    }
}
