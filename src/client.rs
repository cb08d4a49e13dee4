use std::future::Future;

use bytes::Bytes;

use crate::cache::ClientCache;
use crate::command::Command;
use crate::config::Config;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::multi::MultiHandle;
use crate::pubsub::{Subscriber, SubscriptionKind};
use crate::Result;

/// High-level command surface. Every wrapper is a thin veneer over
/// [`Client::execute_command`]; `get` additionally consults the client-side
/// cache when one is configured.
pub struct Client {
    connection: Connection,
    cache: Option<ClientCache>,
    config: Config,
}

impl Client {
    pub async fn connect(config: Config) -> Result<Client> {
        let connection = Connection::connect(config.clone()).await?;
        let cache = (config.client_side_cache_size > 0)
            .then(|| ClientCache::new(config.client_side_cache_size));
        Ok(Client {
            connection,
            cache,
            config,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Uniform entry point taking the command name and its arguments.
    pub async fn execute_command<I, A>(&self, name: &str, args: I) -> Result<Frame>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        let command = Command::new(owned(name)).args(args);
        self.connection.execute(command).await
    }

    pub async fn ping(&self) -> Result<Frame> {
        self.connection.execute(Command::new("PING")).await
    }

    /// `GET`, served from the client-side cache when the key is present.
    pub async fn get(&self, key: &str) -> Result<Frame> {
        let command = Command::new("GET").arg(owned(key));
        match &self.cache {
            None => self.connection.execute(command).await,
            Some(cache) => {
                cache.ensure_channel(&self.connection, &self.config).await?;
                if let Some(hit) = cache.lookup(key.as_bytes()) {
                    return Ok(hit);
                }
                let reply = self.connection.execute(command).await?;
                cache.store_reply(key.as_bytes(), &reply);
                Ok(reply)
            }
        }
    }

    pub async fn set(&self, key: &str, value: impl Into<Bytes>) -> Result<Frame> {
        let command = Command::new("SET").arg(owned(key)).arg(value);
        self.connection.execute(command).await
    }

    pub async fn incr(&self, key: &str) -> Result<Frame> {
        self.connection
            .execute(Command::new("INCR").arg(owned(key)))
            .await
    }

    pub async fn decr(&self, key: &str) -> Result<Frame> {
        self.connection
            .execute(Command::new("DECR").arg(owned(key)))
            .await
    }

    pub async fn del(&self, keys: &[&str]) -> Result<Frame> {
        let command = Command::new("DEL").args(keys.iter().map(|key| owned(key)));
        self.connection.execute(command).await
    }

    pub async fn exists(&self, keys: &[&str]) -> Result<Frame> {
        let command = Command::new("EXISTS").args(keys.iter().map(|key| owned(key)));
        self.connection.execute(command).await
    }

    /// `KEYS`; the pattern defaults to a full scan.
    pub async fn keys(&self, pattern: Option<&str>) -> Result<Frame> {
        let pattern = pattern.unwrap_or("*");
        self.connection
            .execute(Command::new("KEYS").arg(owned(pattern)))
            .await
    }

    pub async fn select(&self, database: u32) -> Result<Frame> {
        self.connection
            .execute(Command::new("SELECT").arg(database.to_string()))
            .await
    }

    pub async fn quit(&self) -> Result<Frame> {
        self.connection.execute(Command::new("QUIT")).await
    }

    pub async fn subscribe(&self, channels: &[&str]) -> Result<Subscriber> {
        self.connection
            .subscribe(SubscriptionKind::Channel, &owned_names(channels))
            .await
    }

    pub async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscriber> {
        self.connection
            .subscribe(SubscriptionKind::Pattern, &owned_names(patterns))
            .await
    }

    pub async fn unsubscribe(&self, channels: &[&str]) -> Result<()> {
        self.connection
            .unsubscribe(SubscriptionKind::Channel, &owned_names(channels))
            .await
    }

    pub async fn punsubscribe(&self, patterns: &[&str]) -> Result<()> {
        self.connection
            .unsubscribe(SubscriptionKind::Pattern, &owned_names(patterns))
            .await
    }

    /// Runs `body` inside a MULTI/EXEC session; see [`Connection::multi`].
    pub async fn multi<F, Fut>(&self, body: F) -> Result<(usize, usize)>
    where
        F: FnOnce(MultiHandle) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.connection.multi(body).await
    }
}

fn owned(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

fn owned_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}
