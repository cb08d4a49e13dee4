mod cache;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod multi;
pub mod pubsub;

pub use client::Client;
pub use command::Command;
pub use config::Config;
pub use connection::Connection;
pub use error::Error;
pub use frame::Frame;

pub type Result<T> = std::result::Result<T, Error>;
