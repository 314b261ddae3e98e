use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ThreadingAnomaly;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Sender {
    pub name: String,
    pub address: String,
}

impl Sender {
    pub fn display(&self) -> &str {
        if self.name.is_empty() {
            &self.address
        } else {
            &self.name
        }
    }
}

/// Immutable facts extracted from one raw message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Envelope {
    /// Message-ID without angle brackets.
    pub identity: String,
    /// Identity was derived from sender/date/subject because Message-ID was missing.
    #[serde(default)]
    pub synthetic_identity: bool,
    pub in_reply_to: Option<String>,
    /// Oldest first, as declared by the sender.
    #[serde(default)]
    pub references: Vec<String>,
    pub subject: String,
    pub sender: Sender,
    pub sent_at: DateTime<Utc>,
    /// `sent_at` is the ingestion time because the Date header was unusable.
    #[serde(default)]
    pub date_fallback: bool,
    pub body: String,
    #[serde(default)]
    pub is_patch: bool,
    #[serde(default)]
    pub patch: Option<String>,
    pub source_id: String,
}

/// One message as handed over by a message source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Header lines including the blank separator line, if any.
    pub header_block: Vec<u8>,
    pub body: Vec<u8>,
    /// Source-specific locator (file path, mbox offset, ...).
    pub key: String,
}

impl RawMessage {
    /// Split a full message at the first empty line.
    pub fn from_bytes(bytes: &[u8], key: impl Into<String>) -> Self {
        let split = find_header_end(bytes).unwrap_or(bytes.len());
        Self {
            header_block: bytes[..split].to_vec(),
            body: bytes[split..].to_vec(),
            key: key.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.header_block.len() + self.body.len());
        bytes.extend_from_slice(&self.header_block);
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn is_empty(&self) -> bool {
        self.header_block.iter().all(u8::is_ascii_whitespace)
            && self.body.iter().all(u8::is_ascii_whitespace)
    }
}

/// Offset just past the blank line that ends the header block.
fn find_header_end(bytes: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' {
            let line = &bytes[line_start..i];
            if line.is_empty() || line == b"\r" {
                return Some(i + 1);
            }
            line_start = i + 1;
        }
    }
    None
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ThreadId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ThreadId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    #[default]
    Open,
    Closed,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

impl FromStr for ThreadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown thread status `{other}`")),
        }
    }
}

/// A conversation: one connected forest of messages.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Thread {
    pub id: ThreadId,
    /// Identity of the structural root (the only member without a parent).
    pub root: String,
    pub subject: String,
    pub is_patch_series: bool,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An envelope together with its place in the forest.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoredMessage {
    pub envelope: Envelope,
    pub thread: ThreadId,
    pub parent: Option<String>,
    #[serde(default)]
    pub anomalies: Vec<ThreadingAnomaly>,
}

impl StoredMessage {
    pub fn identity(&self) -> &str {
        &self.envelope.identity
    }

    /// Every identity this message names as an ancestor, nearest first.
    pub fn declared_parents(&self) -> impl Iterator<Item = &str> {
        self.envelope
            .in_reply_to
            .iter()
            .chain(self.envelope.references.iter().rev())
            .map(String::as_str)
    }

    /// Position of `identity` in [`declared_parents`](Self::declared_parents).
    pub fn parent_rank(&self, identity: &str) -> Option<usize> {
        self.declared_parents().position(|p| p == identity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadSummary {
    #[serde(flatten)]
    pub thread: Thread,
    pub message_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_message_splits_at_blank_line() {
        let raw = RawMessage::from_bytes(b"Subject: hi\r\nFrom: a@b\r\n\r\nbody\r\n", "k");
        assert_eq!(raw.header_block, b"Subject: hi\r\nFrom: a@b\r\n\r\n");
        assert_eq!(raw.body, b"body\r\n");
        assert_eq!(raw.to_bytes(), b"Subject: hi\r\nFrom: a@b\r\n\r\nbody\r\n");
    }

    #[test]
    fn raw_message_without_body() {
        let raw = RawMessage::from_bytes(b"Subject: hi\n", "k");
        assert_eq!(raw.header_block, b"Subject: hi\n");
        assert!(raw.body.is_empty());
        assert!(!raw.is_empty());
        assert!(RawMessage::from_bytes(b"  \n", "k").is_empty());
    }

    #[test]
    fn thread_status_round_trips_through_text() {
        assert_eq!("Closed".parse::<ThreadStatus>(), Ok(ThreadStatus::Closed));
        assert_eq!(ThreadStatus::Open.to_string(), "open");
        assert!("merged".parse::<ThreadStatus>().is_err());
    }
}
