//! Header parser: turns one raw message into an [`Envelope`].

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use mail_parser::MessageParser;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::{
    error::ParseError,
    patch,
    types::{Envelope, RawMessage, Sender},
};

const NO_SUBJECT: &str = "(no subject)";
const SYNTHETIC_DOMAIN: &str = "synthetic.git-ew";

/// Parse one raw message.
///
/// `now` stands in for the sent time when the Date header is missing or
/// unreadable.
pub fn parse_message(
    raw: &RawMessage,
    source_id: &str,
    now: DateTime<Utc>,
) -> Result<Envelope, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::Empty {
            key: raw.key.clone(),
        });
    }

    let bytes = raw.to_bytes();
    let message = MessageParser::default()
        .parse(&bytes)
        .ok_or_else(|| ParseError::Malformed {
            key: raw.key.clone(),
        })?;

    let headers = scan_headers(&raw.header_block);
    let header = |name: &str| headers.get(name).map(String::as_str);

    let sender = message
        .from()
        .and_then(|from| from.first())
        .and_then(|addr| {
            let address = addr.address()?.trim().to_string();
            let name = addr.name().map(str::trim).unwrap_or_default();
            Some(Sender {
                name: if name.is_empty() {
                    address.clone()
                } else {
                    name.to_string()
                },
                address,
            })
        })
        .or_else(|| header("from").map(parse_email_address))
        .unwrap_or_default();

    let subject = message
        .subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let date_raw = header("date").unwrap_or_default();
    let sent_at = parse_date(date_raw);

    let (identity, synthetic_identity) = match header("message-id").and_then(first_identity) {
        Some(id) => (id, false),
        None => {
            if sender.address.is_empty() && date_raw.is_empty() && subject.is_none() {
                return Err(ParseError::NoIdentity {
                    key: raw.key.clone(),
                });
            }
            let subject = subject.as_deref().unwrap_or_default();
            (synthesize_identity(&sender.address, date_raw, subject), true)
        }
    };

    let in_reply_to = header("in-reply-to").and_then(first_identity);
    let references = header("references")
        .map(parse_identity_list)
        .unwrap_or_default();

    let body = message
        .body_text(0)
        .map(|text| text.into_owned())
        .unwrap_or_default();

    let subject = subject.unwrap_or_else(|| NO_SUBJECT.to_string());
    let scan = patch::detect(&subject, &body);
    let patch = scan.extract(&body);

    Ok(Envelope {
        identity,
        synthetic_identity,
        in_reply_to,
        references,
        subject,
        sender,
        sent_at: sent_at.unwrap_or(now),
        date_fallback: sent_at.is_none(),
        body,
        is_patch: scan.is_patch,
        patch,
        source_id: source_id.to_string(),
    })
}

/// Unfold the header block into lowercase-name -> value, first occurrence wins.
fn scan_headers(block: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(block);
    let mut headers = HashMap::new();
    let mut current: Option<(String, String)> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            break;
        }

        // Continuation of the previous header
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if let Some((name, value)) = current.take() {
            headers.entry(name).or_insert(value);
        }
        if let Some(colon) = line.find(':') {
            current = Some((
                line[..colon].trim().to_lowercase(),
                line[colon + 1..].trim().to_string(),
            ));
        }
    }

    if let Some((name, value)) = current {
        headers.entry(name).or_insert(value);
    }
    headers
}

/// Strip whitespace and angle brackets: ` <foo@bar.com> ` -> `foo@bar.com`.
///
/// Returns `None` for tokens that cannot be an identity.
pub fn normalize_identity(s: &str) -> Option<String> {
    let s = s.trim();
    let s = s.strip_prefix('<').unwrap_or(s);
    let s = s.strip_suffix('>').unwrap_or(s).trim();

    if s.is_empty() || s.contains(|c: char| c.is_whitespace() || c == '<' || c == '>') {
        None
    } else {
        Some(s.to_string())
    }
}

fn first_identity(value: &str) -> Option<String> {
    parse_identity_list(value).into_iter().next()
}

/// Parse a `References`-style header into identities, in document order.
///
/// Angle-bracketed tokens are taken as-is; bare tokens only when they look
/// like `local@domain`. Anything else is dropped.
pub fn parse_identity_list(value: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = value;

    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }

        if let Some(after) = rest.strip_prefix('<') {
            let Some(end) = after.find('>') else {
                break;
            };
            ids.extend(normalize_identity(&after[..end]));
            rest = &after[end + 1..];
        } else {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == ',' || c == '<')
                .unwrap_or(rest.len());
            let token = &rest[..end];
            if token.contains('@') {
                ids.extend(normalize_identity(token));
            }
            rest = &rest[end..];
        }
    }

    ids
}

/// Parse email address from "Name <email@example.com>" or "email@example.com" format
fn parse_email_address(s: &str) -> Sender {
    let s = s.trim();

    if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
        if start < end {
            let address = s[start + 1..end].trim().to_string();
            let name = s[..start].trim().trim_matches('"').trim();
            return Sender {
                name: if name.is_empty() {
                    address.clone()
                } else {
                    name.to_string()
                },
                address,
            };
        }
    }

    Sender {
        name: s.to_string(),
        address: s.to_string(),
    }
}

static TRAILING_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\([^)]*\)\s*$").unwrap());

const NAIVE_FORMATS: &[&str] = &[
    "%a %b %e %H:%M:%S %Y",
    "%a, %d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parse the common email date formats; zone-less dates are taken as UTC.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = TRAILING_COMMENT.replace(value.trim(), "");
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Some(date.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Stable identity for messages without a Message-ID.
fn synthesize_identity(sender: &str, date: &str, subject: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.trim().to_lowercase().as_bytes());
    hasher.update([0]);
    hasher.update(date.trim().as_bytes());
    hasher.update([0]);
    hasher.update(subject.trim().as_bytes());
    let digest = hasher.finalize();

    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}@{SYNTHETIC_DOMAIN}")
}

static REPLY_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(re|fwd?|aw)\s*:\s*").unwrap());
static TAG_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\[[^\]]*\]\s*").unwrap());

/// Subject with reply/forward prefixes and leading `[tag]` groups removed.
pub fn clean_subject(subject: &str) -> String {
    let mut clean = subject.trim();
    loop {
        let before = clean.len();
        if let Some(m) = REPLY_PREFIX.find(clean) {
            clean = &clean[m.end()..];
        }
        if let Some(m) = TAG_PREFIX.find(clean) {
            clean = &clean[m.end()..];
        }
        if clean.len() == before {
            break;
        }
    }

    let clean = clean.trim();
    if clean.is_empty() {
        subject.trim().to_string()
    } else {
        clean.to_string()
    }
}

/// Separate new content from quoted text.
///
/// Everything from the first quoted line (`>` or `|`) or `On ... wrote:`
/// attribution onwards counts as quoted.
pub fn split_quoted(body: &str) -> (String, String) {
    let mut fresh = Vec::new();
    let mut quoted = Vec::new();
    let mut in_quote = false;

    for line in body.lines() {
        let stripped = line.trim();
        if !in_quote
            && (stripped.starts_with('>')
                || stripped.starts_with('|')
                || (stripped.starts_with("On ") && stripped.ends_with("wrote:")))
        {
            in_quote = true;
        }

        if in_quote {
            quoted.push(line);
        } else {
            fresh.push(line);
        }
    }

    (
        fresh.join("\n").trim().to_string(),
        quoted.join("\n").trim().to_string(),
    )
}

/// First line of new content, cut to `width` characters.
pub fn reply_preview(body: &str, width: usize) -> Option<String> {
    let (fresh, _) = split_quoted(body);
    let line = fresh.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() <= width {
        return Some(line.to_string());
    }
    let mut cut: String = line.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    Some(cut)
}
