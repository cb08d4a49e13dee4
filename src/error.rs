use thiserror::Error as ThisError;

/// Error taxonomy for the whole crate.
///
/// `Transport` and `Protocol` tear the connection down; `Redis` errors are
/// scoped to a single command; `Usage` errors never touch the wire.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{message}")]
    Redis {
        message: String,
        /// Set when the error was synthesized on teardown rather than
        /// reported by the server.
        disconnected: bool,
    },

    #[error("{message}")]
    Usage {
        message: String,
        channels: usize,
        patterns: usize,
    },

    #[error("command cancelled before completion")]
    Cancelled,
}

impl Error {
    pub fn redis(message: impl Into<String>) -> Error {
        Error::Redis {
            message: message.into(),
            disconnected: false,
        }
    }

    /// The error cascaded into every in-flight command when the stream closes.
    pub fn disconnected() -> Error {
        Error::Redis {
            message: "Server connection is no longer active".to_string(),
            disconnected: true,
        }
    }

    pub fn subscribed_lockout(command: &str, channels: usize, patterns: usize) -> Error {
        Error::Usage {
            message: format!(
                "{} is not allowed while subscribed ({} channels, {} patterns)",
                command, channels, patterns
            ),
            channels,
            patterns,
        }
    }

    pub fn config(message: impl Into<String>) -> Error {
        Error::Usage {
            message: message.into(),
            channels: 0,
            patterns: 0,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            Error::Redis {
                disconnected: true,
                ..
            }
        )
    }
}
