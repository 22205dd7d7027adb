//! Onramp error types

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Session establishment stage that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Connecting to the transport's control channel
    Control,
    /// Loading or generating the persistent identity
    Identity,
    /// Opening the stream/datagram session
    Session,
    /// Attaching the listener
    Listener,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Control => write!(f, "control"),
            Stage::Identity => write!(f, "identity"),
            Stage::Session => write!(f, "session"),
            Stage::Listener => write!(f, "listener"),
        }
    }
}

/// Onramp errors
#[derive(Error, Debug)]
pub enum OnrampError {
    #[error("Keystore path error at {}: {source}", .path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Session establishment failed at {stage} stage: {reason}")]
    Session { stage: Stage, reason: String },

    #[error("Dial to {addr} failed: {reason}")]
    Dial { addr: String, reason: String },

    #[error("TLS bootstrap failed: {0}")]
    Tls(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Session is closed")]
    Closed,

    #[error("Close failed: {}", close_summary(.session, .control))]
    Close {
        session: Option<String>,
        control: Option<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OnrampError {
    /// Build a session establishment error for the given stage
    pub fn session(stage: Stage, reason: impl fmt::Display) -> Self {
        OnrampError::Session {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Build a dial error for the given address
    pub fn dial(addr: impl Into<String>, reason: impl fmt::Display) -> Self {
        OnrampError::Dial {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Stage that failed, if this is a session establishment error
    pub fn stage(&self) -> Option<Stage> {
        match self {
            OnrampError::Session { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

fn close_summary(session: &Option<String>, control: &Option<String>) -> String {
    match (session, control) {
        (Some(s), Some(c)) => format!("session: {}; control: {}", s, c),
        (Some(s), None) => format!("session: {}", s),
        (None, Some(c)) => format!("control: {}", c),
        (None, None) => "unknown".to_string(),
    }
}

/// Result type for onramp operations
pub type Result<T> = std::result::Result<T, OnrampError>;
