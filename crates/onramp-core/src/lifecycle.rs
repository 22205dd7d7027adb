//! Session lifecycle types shared by both transports

use std::fmt;

/// Establishment progress of a transport session. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Uninitialized,
    ControlConnected,
    IdentityReady,
    SessionActive,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::ControlConnected => "control-connected",
            Phase::IdentityReady => "identity-ready",
            Phase::SessionActive => "session-active",
            Phase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Kind of listener requested from a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenKind {
    #[default]
    Stream,
    Datagram,
}

impl ListenKind {
    /// Map a network string to a listener kind.
    ///
    /// `tcp`, `tcp6`, `st`, `st6` select streams; `udp`, `udp6`, `dg`, `dg6`
    /// select datagrams. Anything else is `None`.
    pub fn from_network(network: &str) -> Option<Self> {
        match network {
            "tcp" | "tcp6" | "st" | "st6" => Some(ListenKind::Stream),
            "udp" | "udp6" | "dg" | "dg6" => Some(ListenKind::Datagram),
            _ => None,
        }
    }
}
