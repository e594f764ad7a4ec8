use std::time::Duration;

use crate::protocol::CommandKind;

/// Failures surfaced by the broker bridge.
///
/// Broker-side problems are caught where the response is handled and turned
/// into one of these; nothing here is raised past the engine.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The native channel to the broker is gone. Permanent for the process.
    #[error("broker channel closed: {0}")]
    Channel(String),

    /// The broker answered the command with an `error` field.
    #[error("broker rejected {kind}: {message}")]
    Command { kind: CommandKind, message: String },

    /// An inbound frame could not be decoded.
    #[error("malformed broker frame: {0}")]
    Protocol(String),

    #[error("no broker response to {kind} within {timeout:?}")]
    Timeout { kind: CommandKind, timeout: Duration },

    #[error("native messaging host manifest: {0}")]
    Manifest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn command(kind: CommandKind, message: impl Into<String>) -> Self {
        Self::Command {
            kind,
            message: message.into(),
        }
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, Self::Channel(_))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::BridgeError;
    use crate::protocol::CommandKind;

    #[test]
    fn command_error_names_the_command() {
        let err = BridgeError::command(CommandKind::AcquirePrtSsoCookie, "account_unavailable");
        assert_eq!(
            err.to_string(),
            "broker rejected acquirePrtSsoCookie: account_unavailable"
        );
        assert!(!err.is_channel());
    }

    #[test]
    fn channel_error_is_flagged() {
        assert!(BridgeError::Channel("eof".into()).is_channel());
    }
}
