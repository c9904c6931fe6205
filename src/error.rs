//! Error types for the PSW protocol layer.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, PswError>;

/// Every failure a controller or transport operation can report.
///
/// Each variant renders as a single descriptive line so a front end can log it
/// without further formatting.
#[derive(Error, Debug)]
pub enum PswError {
    #[error("serial port not open")]
    NotConnected,
    #[error("failed to open serial port {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected reply to {command:?}: {reply:?} ({reason})")]
    Protocol {
        command: String,
        reply: String,
        reason: String,
    },
    #[error("no response to {command:?}")]
    NoResponse { command: String },
    #[error("invalid {what}: {value} (must be a finite value >= 0)")]
    InvalidValue { what: &'static str, value: f64 },
}

impl PswError {
    pub(crate) fn protocol(command: &str, reply: &str, reason: impl ToString) -> Self {
        PswError::Protocol {
            command: command.to_string(),
            reply: reply.to_string(),
            reason: reason.to_string(),
        }
    }
}
