//! Sync orchestration: fan out retrieval and parsing, fan in to one
//! serialized assembly stage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::error::{MessageError, SourceError, StorageError};
use super::parser::parse_message;
use super::source::Source;
use super::store::{Repository, Store};
use super::threading::assemble_locked;
use super::types::{Envelope, RawMessage};

/// Cooperative cancellation, honoured between source batches only.
#[derive(Debug, Clone, Default)]
pub struct SyncCancel(Arc<AtomicBool>);

impl SyncCancel {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct SourceReport {
    pub source: String,
    /// Raw messages yielded by the source.
    pub fetched: usize,
    pub new: usize,
    /// Identities already stored, or repeated within the source.
    pub duplicates: usize,
    pub new_threads: usize,
    pub merges: usize,
    pub anomalies: usize,
    /// Per-message problems; the rest of the source still synced.
    pub errors: Vec<MessageError>,
    /// The whole source was unusable.
    pub failure: Option<SourceError>,
    pub committed: bool,
}

impl SourceReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    /// One entry per source, in configured order.
    pub sources: Vec<SourceReport>,
    pub total_new: usize,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn error_count(&self) -> usize {
        self.sources
            .iter()
            .map(|s| s.errors.len() + usize::from(s.failure.is_some()))
            .sum()
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|s| s.failure.is_some())
    }
}

#[derive(Default)]
struct Fetched {
    envelopes: Vec<Envelope>,
    fetched: usize,
    errors: Vec<MessageError>,
    failure: Option<SourceError>,
    skipped: bool,
}

/// Retrieve and parse every message of one source.
fn fetch(source: &Source, now: DateTime<Utc>) -> Fetched {
    let messages = match source.enumerate() {
        Ok(messages) => messages,
        Err(err) => {
            warn!(source = %source.id, %err, "source unavailable");
            return Fetched {
                failure: Some(err),
                ..Default::default()
            };
        }
    };

    let mut raw: Vec<RawMessage> = Vec::new();
    let mut errors = Vec::new();
    for item in messages {
        match item {
            Ok(msg) => raw.push(msg),
            Err(err) => {
                debug!(source = %source.id, %err, "cannot read message");
                errors.push(MessageError::Read(err));
            }
        }
    }

    let fetched = raw.len();
    let parsed: Vec<_> = raw
        .par_iter()
        .map(|msg| parse_message(msg, &source.id, now))
        .collect();

    let mut envelopes = Vec::with_capacity(parsed.len());
    for result in parsed {
        match result {
            Ok(envelope) => envelopes.push(envelope),
            Err(err) => {
                debug!(source = %source.id, %err, "skipping message");
                errors.push(MessageError::Parse(err));
            }
        }
    }

    Fetched {
        envelopes,
        fetched,
        errors,
        failure: None,
        skipped: false,
    }
}

/// Drop already stored identities and repeats within the batch.
///
/// Among repeats a real Message-ID wins over a synthesized one.
fn dedup(
    envelopes: Vec<Envelope>,
    known: &HashSet<String>,
    report: &mut SourceReport,
) -> Vec<Envelope> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut batch: Vec<Envelope> = Vec::with_capacity(envelopes.len());

    for envelope in envelopes {
        if known.contains(&envelope.identity) {
            report.duplicates += 1;
            continue;
        }
        match seen.get(&envelope.identity) {
            Some(&i) => {
                report.duplicates += 1;
                if batch[i].synthetic_identity && !envelope.synthetic_identity {
                    batch[i] = envelope;
                }
            }
            None => {
                seen.insert(envelope.identity.clone(), batch.len());
                batch.push(envelope);
            }
        }
    }

    batch
}

/// Sync every source into the store.
///
/// Sources are fetched and parsed concurrently, then assembled one batch
/// per source in the given order. A source failure is reported and the
/// other sources proceed; a storage failure aborts the sync, leaving the
/// batches committed so far in place.
pub fn sync<R: Repository>(
    store: &Store<R>,
    sources: &[Source],
    cancel: &SyncCancel,
) -> Result<SyncReport, StorageError> {
    let now = Utc::now();

    let fetched: Vec<Fetched> = sources
        .par_iter()
        .map(|source| {
            if cancel.is_cancelled() {
                Fetched {
                    skipped: true,
                    ..Default::default()
                }
            } else {
                fetch(source, now)
            }
        })
        .collect();

    let _guard = store.lock_assembly();
    let repo = store.repository();
    let mut known = repo.known_identities()?;
    let mut report = SyncReport::default();

    for (source, fetched) in sources.iter().zip(fetched) {
        let mut source_report = SourceReport::new(&source.id);
        if fetched.skipped || cancel.is_cancelled() {
            if !report.cancelled {
                info!(source = %source.id, "sync cancelled");
            }
            report.cancelled = true;
            report.sources.push(source_report);
            continue;
        }

        source_report.fetched = fetched.fetched;
        source_report.errors = fetched.errors;
        if let Some(failure) = fetched.failure {
            source_report.failure = Some(failure);
            report.sources.push(source_report);
            continue;
        }

        let mut batch = dedup(fetched.envelopes, &known, &mut source_report);
        batch.sort_by_key(|envelope| envelope.sent_at);
        let identities: Vec<String> = batch.iter().map(|e| e.identity.clone()).collect();

        let outcome = assemble_locked(repo, batch)?;
        known.extend(identities);

        source_report.new = outcome.inserted;
        source_report.duplicates += outcome.duplicates;
        source_report.new_threads = outcome.new_threads;
        source_report.merges = outcome.merges;
        source_report.anomalies = outcome.anomalies.len();
        source_report.committed = true;
        report.total_new += outcome.inserted;

        info!(
            source = %source.id,
            fetched = source_report.fetched,
            new = source_report.new,
            duplicates = source_report.duplicates,
            threads = source_report.new_threads,
            merges = source_report.merges,
            errors = source_report.errors.len(),
            "source synced"
        );
        report.sources.push(source_report);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::store::{HookedRepository, MemoryRepository};

    fn raw(id: Option<&str>, date: &str, irt: Option<&str>) -> RawMessage {
        let mut text = format!("From: Ann <ann@example.com>\nDate: {date}\nSubject: hello\n");
        if let Some(id) = id {
            text.push_str(&format!("Message-ID: <{id}>\n"));
        }
        if let Some(irt) = irt {
            text.push_str(&format!("In-Reply-To: <{irt}>\n"));
        }
        text.push_str("\nbody\n");
        RawMessage::from_bytes(text.as_bytes(), id.unwrap_or("anon"))
    }

    #[test]
    fn missing_source_does_not_stop_the_others() {
        let store = Store::new(MemoryRepository::new());
        let sources = vec![
            Source::maildir("gone", "/nonexistent/git-ew/maildir"),
            Source::memory(
                "mem",
                vec![raw(Some("a@x"), "Mon, 1 Jan 2024 10:00:00 +0000", None)],
            ),
        ];

        let report = sync(&store, &sources, &SyncCancel::default()).unwrap();
        assert!(matches!(report.sources[0].failure, Some(SourceError::NotFound(_))));
        assert!(!report.sources[0].committed);
        assert_eq!(report.sources[1].new, 1);
        assert_eq!(report.total_new, 1);
        assert_eq!(report.error_count(), 1);
    }

    #[test]
    fn out_of_order_batch_is_sorted_by_sent_time() {
        let store = Store::new(MemoryRepository::new());
        let sources = vec![Source::memory(
            "mem",
            vec![
                raw(Some("b@x"), "Mon, 1 Jan 2024 11:00:00 +0000", Some("a@x")),
                raw(Some("a@x"), "Mon, 1 Jan 2024 10:00:00 +0000", None),
            ],
        )];

        let report = sync(&store, &sources, &SyncCancel::default()).unwrap();
        assert_eq!(report.sources[0].new_threads, 1);
        let b = store.repository().find_by_identity("b@x").unwrap().unwrap();
        assert_eq!(b.parent.as_deref(), Some("a@x"));
    }

    #[test]
    fn unparseable_messages_are_counted_not_fatal() {
        let store = Store::new(MemoryRepository::new());
        let sources = vec![Source::memory(
            "mem",
            vec![
                RawMessage::from_bytes(b"\n\n", "blank"),
                raw(Some("a@x"), "Mon, 1 Jan 2024 10:00:00 +0000", None),
            ],
        )];

        let report = sync(&store, &sources, &SyncCancel::default()).unwrap();
        assert_eq!(report.sources[0].fetched, 2);
        assert_eq!(report.sources[0].new, 1);
        assert!(matches!(report.sources[0].errors[0], MessageError::Parse(_)));
    }

    #[test]
    fn repeats_within_a_source_are_stored_once() {
        let store = Store::new(MemoryRepository::new());
        let msg = raw(Some("a@x"), "Mon, 1 Jan 2024 10:00:00 +0000", None);
        let sources = vec![Source::memory("mem", vec![msg.clone(), msg])];

        let report = sync(&store, &sources, &SyncCancel::default()).unwrap();
        assert_eq!(report.sources[0].new, 1);
        assert_eq!(report.sources[0].duplicates, 1);
    }

    #[test]
    fn synthetic_identity_is_stable_across_syncs() {
        let store = Store::new(MemoryRepository::new());
        let sources = vec![Source::memory(
            "mem",
            vec![raw(None, "not a date", None)],
        )];

        let first = sync(&store, &sources, &SyncCancel::default()).unwrap();
        let second = sync(&store, &sources, &SyncCancel::default()).unwrap();
        assert_eq!(first.total_new, 1);
        assert_eq!(second.total_new, 0);
        assert_eq!(second.sources[0].duplicates, 1);
    }

    #[test]
    fn cancelled_sync_commits_nothing() {
        let store = Store::new(MemoryRepository::new());
        let cancel = SyncCancel::default();
        cancel.cancel();
        let sources = vec![Source::memory(
            "mem",
            vec![raw(Some("a@x"), "Mon, 1 Jan 2024 10:00:00 +0000", None)],
        )];

        let report = sync(&store, &sources, &cancel).unwrap();
        assert!(report.cancelled);
        assert!(!report.sources[0].committed);
        assert!(store.repository().known_identities().unwrap().is_empty());
    }

    #[test]
    fn cancel_takes_effect_at_the_next_source() {
        let cancel = SyncCancel::default();
        let on_commit = cancel.clone();
        let store = Store::new(HookedRepository {
            inner: MemoryRepository::new(),
            before_commit: move || {
                on_commit.cancel();
                Ok(())
            },
        });
        let sources = vec![
            Source::memory(
                "first",
                vec![raw(Some("a@x"), "Mon, 1 Jan 2024 10:00:00 +0000", None)],
            ),
            Source::memory(
                "second",
                vec![raw(Some("b@x"), "Mon, 1 Jan 2024 11:00:00 +0000", Some("a@x"))],
            ),
        ];

        let report = sync(&store, &sources, &cancel).unwrap();
        assert!(report.cancelled);
        assert!(report.sources[0].committed);
        assert_eq!(report.sources[0].new, 1);
        assert!(!report.sources[1].committed);
        assert_eq!(report.sources[1].new, 0);
        assert_eq!(report.total_new, 1);

        let known = store.repository().known_identities().unwrap();
        assert!(known.contains("a@x"));
        assert!(!known.contains("b@x"));
    }
}
