use std::{fmt, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::ThreadId;

/// A single raw message could not be turned into an envelope.
///
/// Never fatal: the sync skips the message and counts it in the report.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message {key} is empty")]
    Empty { key: String },
    #[error("cannot parse message {key}")]
    Malformed { key: String },
    #[error("message {key} has no Message-ID and nothing to derive one from")]
    NoIdentity { key: String },
}

/// A message source (or one entry of it) could not be read.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source path {0} does not exist")]
    NotFound(PathBuf),
    #[error("cannot read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot walk {path}: {reason}")]
    Walk { path: PathBuf, reason: String },
    #[error("remote archive {0} cannot be fetched yet")]
    Unsupported(String),
}

/// The repository failed. Aborts the current unit of work.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("message {0} is already stored")]
    Duplicate(String),
    #[error("message {0} is not stored")]
    UnknownMessage(String),
    #[error("thread {0} does not exist")]
    UnknownThread(ThreadId),
    #[error("repository lock poisoned")]
    Poisoned,
    #[error("cannot write snapshot {path}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot encode snapshot")]
    Encode(#[from] bincode::Error),
}

/// A reply could not be prepared.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("thread {0} does not exist")]
    ThreadMissing(ThreadId),
    #[error("message {0} does not exist")]
    TargetMissing(String),
    #[error("message {identity} is not part of thread {thread}")]
    TargetOutsideThread { identity: String, thread: ThreadId },
    #[error("no sender address configured")]
    MissingSender,
    #[error("message {0} has no sender address to reply to")]
    NoRecipient(String),
    #[error("cannot render outbound message")]
    Render(#[source] io::Error),
}

/// Handing a composed message over to the mail transport failed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send command is empty")]
    EmptyCommand,
    #[error("cannot run send command `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("send command `{command}` failed: {stderr}")]
    Rejected { command: String, stderr: String },
    #[error(transparent)]
    Compose(#[from] ComposeError),
}

/// Structural contradiction found while threading.
///
/// Resolved locally with a deterministic fallback and only recorded for
/// observability, never returned as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadingAnomaly {
    /// The message named itself as its own parent.
    SelfReference,
    /// `In-Reply-To` and the tail of `References` name different parents.
    ParentDisagreement {
        in_reply_to: String,
        references_tail: String,
    },
    /// Linking under `parent` would have closed a cycle.
    CycleRejected { parent: String },
}

impl fmt::Display for ThreadingAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfReference => write!(f, "message replies to itself"),
            Self::ParentDisagreement {
                in_reply_to,
                references_tail,
            } => write!(
                f,
                "In-Reply-To <{in_reply_to}> disagrees with References tail <{references_tail}>"
            ),
            Self::CycleRejected { parent } => write!(f, "edge to <{parent}> would form a cycle"),
        }
    }
}

/// Per-message problem collected during a sync.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Read(#[from] SourceError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
