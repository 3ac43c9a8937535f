// src/core/errors.rs

//! The central error type for HyperCache, covering wire protocol errors,
//! cluster routing redirects, store errors, and persistence failures.

use thiserror::Error;

/// The single error type threaded through the RESP server, the store, and
/// the persistence engine.
///
/// Variants map directly onto the error taxonomy of the RESP protocol:
/// protocol/store errors become `-ERR ...`, routing redirects become
/// `-MOVED ...` or `-CROSSSLOT ...`, and only `PersistenceFatal` ever causes
/// the process to refuse to start rather than reply to a client.
#[derive(Error, Debug)]
pub enum HyperCacheError {
    /// Malformed RESP frame, unknown command, wrong arity, or a bad option.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The parser needs more bytes before it can produce a frame. Never
    /// surfaced to a client; `Decoder::decode` turns this into `Ok(None)`.
    #[error("incomplete frame")]
    IncompleteFrame,

    /// A key is not owned by this node. Carries the routing target so the
    /// connection layer can format the exact `-MOVED` reply.
    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    /// A multi-key command's keys span more than one slot.
    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    /// No node currently owns the slot (can happen transiently right after
    /// a membership change, before the slot table rebuild completes).
    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),

    /// Command execution exceeded `command_timeout`.
    #[error("ERR timeout")]
    Timeout,

    /// Memory ceiling exceeded even after eviction, or an invalid argument.
    #[error("store error: {0}")]
    Store(String),

    /// Directory unreadable at startup, or a snapshot inconsistent with no
    /// older fallback. Refuses to start; never returned from a running
    /// server's command path.
    #[error("persistence fatal: {0}")]
    PersistenceFatal(String),

    /// Another process already holds the data directory lock.
    #[error("data directory already locked: {0}")]
    AlreadyLocked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("decoding error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Clone for HyperCacheError {
    fn clone(&self) -> Self {
        match self {
            Self::Protocol(s) => Self::Protocol(s.clone()),
            Self::IncompleteFrame => Self::IncompleteFrame,
            Self::Moved { slot, addr } => Self::Moved {
                slot: *slot,
                addr: addr.clone(),
            },
            Self::CrossSlot => Self::CrossSlot,
            Self::ClusterDown(s) => Self::ClusterDown(s.clone()),
            Self::Timeout => Self::Timeout,
            Self::Store(s) => Self::Store(s.clone()),
            Self::PersistenceFatal(s) => Self::PersistenceFatal(s.clone()),
            Self::AlreadyLocked(s) => Self::AlreadyLocked(s.clone()),
            // io::Error isn't Clone; re-wrap with the same kind and message.
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Encode(s) => Self::Encode(s.clone()),
            Self::Decode(s) => Self::Decode(s.clone()),
            Self::Config(s) => Self::Config(s.clone()),
        }
    }
}

impl PartialEq for HyperCacheError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Protocol(a), Self::Protocol(b)) => a == b,
            (Self::IncompleteFrame, Self::IncompleteFrame) => true,
            (Self::Moved { slot: s1, addr: a1 }, Self::Moved { slot: s2, addr: a2 }) => {
                s1 == s2 && a1 == a2
            }
            (Self::CrossSlot, Self::CrossSlot) => true,
            (Self::ClusterDown(a), Self::ClusterDown(b)) => a == b,
            (Self::Timeout, Self::Timeout) => true,
            (Self::Store(a), Self::Store(b)) => a == b,
            (Self::PersistenceFatal(a), Self::PersistenceFatal(b)) => a == b,
            (Self::AlreadyLocked(a), Self::AlreadyLocked(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::Encode(a), Self::Encode(b)) => a == b,
            (Self::Decode(a), Self::Decode(b)) => a == b,
            (Self::Config(a), Self::Config(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl From<std::string::FromUtf8Error> for HyperCacheError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        HyperCacheError::Protocol(format!("invalid utf-8: {e}"))
    }
}

impl From<std::num::ParseIntError> for HyperCacheError {
    fn from(e: std::num::ParseIntError) -> Self {
        HyperCacheError::Protocol(format!("not an integer: {e}"))
    }
}

impl HyperCacheError {
    /// Renders the exact bytes that go after the leading `-` of a RESP error
    /// reply (without the trailing CRLF, which the codec adds).
    pub fn as_resp_error_body(&self) -> String {
        match self {
            HyperCacheError::Protocol(s) => format!("ERR {s}"),
            HyperCacheError::Moved { slot, addr } => format!("MOVED {slot} {addr}"),
            HyperCacheError::CrossSlot | HyperCacheError::ClusterDown(_) => self.to_string(),
            HyperCacheError::Timeout => self.to_string(),
            HyperCacheError::Store(s) => format!("ERR {s}"),
            other => format!("ERR {other}"),
        }
    }

    /// Whether this error should close the connection once the reply has
    /// been flushed, per the propagation policy in
    pub fn closes_connection(&self) -> bool {
        matches!(self, HyperCacheError::Timeout | HyperCacheError::Io(_))
    }
}
