use crate::samil::frame::MessageId;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the inverter protocol layer.
///
/// Only `Transport` and `Timeout` leave a session unusable; `MalformedFrame`
/// and `UnexpectedFrame` are reported while a request keeps reading.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unexpected frame: expected id {expected}, got {actual}")]
    UnexpectedFrame {
        expected: MessageId,
        actual: MessageId,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("inverter search cancelled")]
    Cancelled,

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// True when the session that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::Transport(_) | Error::Timeout(_)
        )
    }
}

/// Creates an anyhow error prefixed with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*)
        )
    };
}
