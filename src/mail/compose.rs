//! Outbound replies that thread into existing conversations.

use chrono::{DateTime, Utc};
use mail_builder::MessageBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use super::error::ComposeError;
use super::types::{Envelope, RawMessage, Sender};

/// Longest `References` value (identities with brackets and separators).
pub const DEFAULT_MAX_REFERENCES_LEN: usize = 998;

/// Everything starting with "Re:" (case and whitespace insensitive) is a prefix.
static REPLY_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new("(?i:\\s*re\\s*:\\s*)*(.*)").unwrap());

/// Subject of a reply: exactly one leading `Re: `.
pub fn reply_subject(subject: &str) -> String {
    let rest = match REPLY_PREFIX.captures(subject).and_then(|cap| cap.get(1)) {
        Some(rest) => rest.as_str(),
        None => subject,
    };
    format!("Re: {}", rest.trim())
}

/// Drop the oldest identities until the rendered list fits in `max_len`.
/// The newest identity is always kept.
pub fn cap_references(mut references: Vec<String>, max_len: usize) -> Vec<String> {
    let rendered = |ids: &[String]| -> usize {
        ids.iter().map(|id| id.len() + 2).sum::<usize>() + ids.len().saturating_sub(1)
    };

    let mut drop = 0;
    while references.len() - drop > 1 && rendered(&references[drop..]) > max_len {
        drop += 1;
    }
    references.drain(..drop);
    references
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderIdentity {
    pub name: String,
    pub email: String,
    /// Right-hand side of generated Message-IDs; defaults to the email domain.
    pub domain: Option<String>,
}

impl SenderIdentity {
    fn domain(&self) -> &str {
        match &self.domain {
            Some(domain) if !domain.is_empty() => domain,
            _ => self
                .email
                .rsplit_once('@')
                .map(|(_, domain)| domain)
                .filter(|domain| !domain.is_empty())
                .unwrap_or("localhost"),
        }
    }
}

/// A reply ready to hand over to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub identity: String,
    pub in_reply_to: String,
    /// Oldest first, ending with `in_reply_to`.
    pub references: Vec<String>,
    pub subject: String,
    pub from: Sender,
    pub to: Sender,
    pub date: DateTime<Utc>,
    pub body: String,
}

impl OutboundMessage {
    /// RFC 5322 text of the message.
    pub fn render(&self) -> Result<Vec<u8>, ComposeError> {
        MessageBuilder::new()
            .from((self.from.name.as_str(), self.from.address.as_str()))
            .to((self.to.name.as_str(), self.to.address.as_str()))
            .subject(self.subject.as_str())
            .date(self.date.timestamp())
            .message_id(self.identity.as_str())
            .in_reply_to(self.in_reply_to.as_str())
            .references(self.references.iter().map(String::as_str).collect::<Vec<_>>())
            .text_body(self.body.as_str())
            .write_to_vec()
            .map_err(ComposeError::Render)
    }

    /// The message as a source would yield it, for re-ingestion.
    pub fn to_raw(&self) -> Result<RawMessage, ComposeError> {
        let bytes = self.render()?;
        Ok(RawMessage::from_bytes(&bytes, format!("outbound:{}", self.identity)))
    }
}

#[derive(Debug, Clone)]
pub struct Composer {
    sender: SenderIdentity,
    max_references_len: usize,
}

impl Composer {
    pub fn new(sender: SenderIdentity, max_references_len: usize) -> Self {
        Self {
            sender,
            max_references_len,
        }
    }

    /// Prepare a reply to `target`. Nothing is sent.
    pub fn compose(&self, target: &Envelope, body: &str) -> Result<OutboundMessage, ComposeError> {
        if self.sender.email.trim().is_empty() {
            return Err(ComposeError::MissingSender);
        }
        if target.sender.address.is_empty() {
            return Err(ComposeError::NoRecipient(target.identity.clone()));
        }

        let mut references: Vec<String> = target
            .references
            .iter()
            .filter(|id| **id != target.identity)
            .cloned()
            .collect();
        references.push(target.identity.clone());

        let from = Sender {
            name: if self.sender.name.is_empty() {
                self.sender.email.clone()
            } else {
                self.sender.name.clone()
            },
            address: self.sender.email.clone(),
        };

        Ok(OutboundMessage {
            identity: format!("{}@{}", Uuid::new_v4(), self.sender.domain()),
            in_reply_to: target.identity.clone(),
            references: cap_references(references, self.max_references_len),
            subject: reply_subject(&target.subject),
            from,
            to: target.sender.clone(),
            date: Utc::now(),
            body: body.to_string(),
        })
    }
}
