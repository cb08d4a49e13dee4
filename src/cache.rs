use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::command::Command;
use crate::config::Config;
use crate::connection::{Connection, Protocol, INVALIDATION_CHANNEL};
use crate::frame::Frame;
use crate::pubsub::SubscriptionKind;
use crate::{Error, Result};

/// Bounded LRU of `GET` replies keyed by the bulk-string key.
struct Lru {
    capacity: usize,
    entries: HashMap<Vec<u8>, Frame>,
    // Most recently used at the back.
    order: VecDeque<Vec<u8>>,
}

impl Lru {
    fn new(capacity: usize) -> Lru {
        Lru {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<Frame> {
        let value = self.entries.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    fn insert(&mut self, key: Vec<u8>, value: Frame) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push_back(key);
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn invalidate(&mut self, key: &[u8]) {
        // A miss is a no-op.
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn touch(&mut self, key: &[u8]) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_vec());
    }
}

/// How invalidations reach this cache.
enum CacheChannel {
    /// RESP3: invalidation pushes share the main connection.
    Shared,
    /// RESP2: an owned sibling connection subscribed to the invalidation
    /// channel, with server tracking redirected at it.
    Sibling(#[allow(dead_code)] Connection),
}

/// Client-side cache of `GET` replies, evicted by server invalidation
/// messages. The invalidation channel is wired up lazily on first use.
pub(crate) struct ClientCache {
    store: Arc<Mutex<Lru>>,
    channel: OnceCell<CacheChannel>,
}

impl ClientCache {
    pub(crate) fn new(capacity: usize) -> ClientCache {
        ClientCache {
            store: Arc::new(Mutex::new(Lru::new(capacity))),
            channel: OnceCell::new(),
        }
    }

    pub(crate) fn lookup(&self, key: &[u8]) -> Option<Frame> {
        self.store.lock().unwrap().get(key)
    }

    pub(crate) fn store_reply(&self, key: &[u8], reply: &Frame) {
        self.store
            .lock()
            .unwrap()
            .insert(key.to_vec(), reply.clone());
    }

    /// Connects the eviction input: on RESP3 the main connection's push
    /// frames feed it directly; on RESP2 a sibling connection subscribes to
    /// the invalidation channel and the server redirects tracking at it.
    pub(crate) async fn ensure_channel(
        &self,
        connection: &Connection,
        config: &Config,
    ) -> Result<()> {
        self.channel
            .get_or_try_init(|| async {
                let (sink, mut evictions) = mpsc::unbounded_channel::<Vec<Bytes>>();

                let store = self.store.clone();
                tokio::spawn(async move {
                    while let Some(keys) = evictions.recv().await {
                        let mut store = store.lock().unwrap();
                        if keys.is_empty() {
                            // Nil invalidation payload: the whole tracking
                            // table was flushed.
                            store.clear();
                        } else {
                            for key in keys {
                                store.invalidate(&key);
                            }
                        }
                    }
                });

                if connection.protocol() == Protocol::Resp3 {
                    connection.set_invalidation_sink(sink);
                    let tracking = Command::new("CLIENT").arg("TRACKING").arg("ON");
                    connection.execute(tracking).await?;
                    info!("client-side cache sharing the main connection");
                    Ok::<_, Error>(CacheChannel::Shared)
                } else {
                    let mut sibling_config = config.clone();
                    sibling_config.client_side_cache_size = 0;
                    sibling_config.on_disconnect = None;
                    let sibling = Connection::connect(sibling_config).await?;

                    let id = sibling
                        .execute(Command::new("CLIENT").arg("ID"))
                        .await?
                        .into_integer()
                        .ok_or_else(|| {
                            Error::Protocol("CLIENT ID did not return an integer".to_string())
                        })?;

                    sibling.set_invalidation_sink(sink);
                    let subscriber = sibling
                        .subscribe(
                            SubscriptionKind::Channel,
                            &[INVALIDATION_CHANNEL.to_string()],
                        )
                        .await?;
                    // Invalidation payloads are intercepted before sink
                    // delivery, so the subscriber handle itself is unused.
                    drop(subscriber);

                    let redirect = Command::new("CLIENT")
                        .arg("TRACKING")
                        .arg("ON")
                        .arg("REDIRECT")
                        .arg(id.to_string());
                    connection.execute(redirect).await?;

                    debug!(client_id = id, "client-side cache wired to a sibling connection");
                    Ok(CacheChannel::Sibling(sibling))
                }
            })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(text: &str) -> Frame {
        Frame::Bulk(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut lru = Lru::new(2);
        lru.insert(b"a".to_vec(), bulk("1"));
        lru.insert(b"b".to_vec(), bulk("2"));

        // Touch `a` so `b` becomes the eviction candidate.
        assert!(lru.get(b"a").is_some());
        lru.insert(b"c".to_vec(), bulk("3"));

        assert!(lru.get(b"a").is_some());
        assert!(lru.get(b"b").is_none());
        assert!(lru.get(b"c").is_some());
    }

    #[test]
    fn lru_invalidate_removes_entry() {
        let mut lru = Lru::new(4);
        lru.insert(b"k".to_vec(), bulk("v"));
        lru.invalidate(b"k");
        assert!(lru.get(b"k").is_none());

        // Invalidating an absent key is a no-op.
        lru.invalidate(b"missing");
    }

    #[test]
    fn lru_reinsert_updates_value() {
        let mut lru = Lru::new(2);
        lru.insert(b"k".to_vec(), bulk("old"));
        lru.insert(b"k".to_vec(), bulk("new"));
        assert_eq!(lru.get(b"k"), Some(bulk("new")));
        assert_eq!(lru.order.len(), 1);
    }
}
