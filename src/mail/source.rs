//! Message sources: where raw messages come from.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use super::error::SourceError;
use super::types::RawMessage;

/// Lazy, finite sequence of raw messages. Restart by enumerating again.
pub type RawMessages<'a> = Box<dyn Iterator<Item = Result<RawMessage, SourceError>> + Send + 'a>;

#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    /// Directory tree with one message per file (maildir or plain).
    Maildir { path: PathBuf },
    /// Single mbox archive, optionally gzip compressed.
    Mbox { path: PathBuf },
    /// Public-inbox style archive. Not fetchable yet.
    Remote { url: String },
    Memory { messages: Vec<RawMessage> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: String,
    pub kind: SourceKind,
}

impl Source {
    pub fn maildir(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kind: SourceKind::Maildir { path: path.into() },
        }
    }

    pub fn mbox(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kind: SourceKind::Mbox { path: path.into() },
        }
    }

    pub fn remote(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SourceKind::Remote { url: url.into() },
        }
    }

    pub fn memory(id: impl Into<String>, messages: Vec<RawMessage>) -> Self {
        Self {
            id: id.into(),
            kind: SourceKind::Memory { messages },
        }
    }

    /// Start enumerating. Failing here means the whole source is unusable;
    /// errors yielded by the iterator only concern single entries.
    pub fn enumerate(&self) -> Result<RawMessages<'_>, SourceError> {
        match &self.kind {
            SourceKind::Maildir { path } => maildir_messages(path),
            SourceKind::Mbox { path } => mbox_messages(path),
            SourceKind::Remote { url } => Err(SourceError::Unsupported(url.clone())),
            SourceKind::Memory { messages } => Ok(Box::new(messages.iter().cloned().map(Ok))),
        }
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') || name == "tmp")
}

fn maildir_messages(root: &Path) -> Result<RawMessages<'static>, SourceError> {
    if !root.is_dir() {
        return Err(SourceError::NotFound(root.to_path_buf()));
    }

    let root = root.to_path_buf();
    let walker = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry));

    Ok(Box::new(walker.filter_map(move |entry| {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                return Some(Err(SourceError::Walk {
                    path: err.path().unwrap_or(root.as_path()).to_path_buf(),
                    reason: err.to_string(),
                }));
            }
        };
        if !entry.file_type().is_file() {
            return None;
        }

        let path = entry.into_path();
        match std::fs::read(&path) {
            Ok(bytes) => Some(Ok(RawMessage::from_bytes(
                &bytes,
                path.display().to_string(),
            ))),
            Err(source) => Some(Err(SourceError::Io { path, source })),
        }
    })))
}

fn mbox_messages(path: &Path) -> Result<RawMessages<'static>, SourceError> {
    if !path.is_file() {
        return Err(SourceError::NotFound(path.to_path_buf()));
    }

    let file = File::open(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader: Box<dyn Read + Send> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    debug!(path = %path.display(), "reading mbox");
    Ok(Box::new(MboxReader::new(
        BufReader::new(reader),
        path.to_path_buf(),
    )))
}

/// Splits an mbox stream on `From ` separator lines.
struct MboxReader<R> {
    reader: R,
    path: PathBuf,
    /// Separator line already read for the next message.
    pending: bool,
    index: usize,
    done: bool,
}

impl<R: BufRead> MboxReader<R> {
    fn new(reader: R, path: PathBuf) -> Self {
        Self {
            reader,
            path,
            pending: false,
            index: 0,
            done: false,
        }
    }

    fn next_message(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        let mut message = Vec::new();
        let mut started = std::mem::take(&mut self.pending);
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut line)
                .map_err(|source| SourceError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            if read == 0 {
                self.done = true;
                break;
            }

            if line.starts_with(b"From ") {
                if started {
                    self.pending = true;
                    break;
                }
                started = true;
                continue;
            }
            if !started {
                // junk before the first separator
                continue;
            }

            message.extend_from_slice(unescape_from(&line));
        }

        if !started {
            return Ok(None);
        }
        // the blank line before a separator belongs to the mbox, not the message
        if message.ends_with(b"\n\n") {
            message.pop();
        } else if message.ends_with(b"\r\n\r\n") {
            message.truncate(message.len() - 2);
        }
        Ok(Some(message))
    }
}

/// `>From ` (any number of `>`) loses one `>`.
fn unescape_from(line: &[u8]) -> &[u8] {
    let quotes = line.iter().take_while(|&&b| b == b'>').count();
    if quotes > 0 && line[quotes..].starts_with(b"From ") {
        &line[1..]
    } else {
        line
    }
}

impl<R: BufRead> Iterator for MboxReader<R> {
    type Item = Result<RawMessage, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done && !self.pending {
            return None;
        }

        match self.next_message() {
            Ok(Some(bytes)) => {
                let key = format!("{}#{}", self.path.display(), self.index);
                self.index += 1;
                Some(Ok(RawMessage::from_bytes(&bytes, key)))
            }
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
