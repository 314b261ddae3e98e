pub mod cache;
pub mod compose;
pub mod error;
pub mod flatten;
pub mod parser;
pub mod patch;
pub mod service;
pub mod source;
pub mod store;
pub mod sync;
pub mod threading;
pub mod transport;
pub mod types;

pub use compose::{Composer, OutboundMessage, SenderIdentity};
pub use error::{Error, Result, ThreadingAnomaly};
pub use flatten::{ShapeNode, annotate, tree_prefix};
pub use parser::{clean_subject, parse_message, reply_preview, split_quoted};
pub use service::{ThreadFilter, ThreadView, Workspace};
pub use source::{Source, SourceKind};
pub use store::{MemoryRepository, Repository, Store};
pub use sync::{SourceReport, SyncCancel, SyncReport, sync};
pub use threading::{AssemblyOutcome, assemble};
pub use transport::{MailTransport, SendmailTransport};
pub use types::{
    Envelope, RawMessage, Sender, StoredMessage, Thread, ThreadId, ThreadStatus, ThreadSummary,
};
