//! Textual patch detection.
//!
//! Pure heuristics: no attempt is made to validate that a diff applies.

use std::ops::Range;

/// Result of scanning one message for patch content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchScan {
    pub is_patch: bool,
    /// Line ranges (0-based, end exclusive) of the body that look like diffs.
    pub ranges: Vec<Range<usize>>,
}

impl PatchScan {
    /// Text of every detected range, in order.
    pub fn extract(&self, body: &str) -> Option<String> {
        if self.ranges.is_empty() {
            return None;
        }

        let lines: Vec<&str> = body.lines().collect();
        let mut out = String::new();
        for range in &self.ranges {
            for line in &lines[range.start..range.end.min(lines.len())] {
                out.push_str(line);
                out.push('\n');
            }
        }
        Some(out)
    }
}

/// Classify a message from its subject and body.
///
/// Any one rule is enough: a `[PATCH` token in the subject, a
/// `diff --git ` line, or a `--- ` line directly followed by `+++ `.
pub fn detect(subject: &str, body: &str) -> PatchScan {
    let ranges = diff_ranges(body);
    PatchScan {
        is_patch: subject.contains("[PATCH") || !ranges.is_empty(),
        ranges,
    }
}

fn diff_ranges(body: &str) -> Vec<Range<usize>> {
    let lines: Vec<&str> = body.lines().collect();
    let mut ranges = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if !starts_diff(&lines, i) {
            i += 1;
            continue;
        }

        let start = i;
        i += 1;
        while i < lines.len() && (continues_diff(lines[i]) || starts_diff(&lines, i)) {
            i += 1;
        }
        ranges.push(start..i);
    }

    ranges
}

fn starts_diff(lines: &[&str], i: usize) -> bool {
    let line = lines[i];
    line.starts_with("diff --git ")
        || (line.starts_with("--- ")
            && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ ")))
}

const DIFF_PREFIXES: &[&str] = &[
    "diff ",
    "index ",
    "--- ",
    "+++ ",
    "@@",
    "new file mode",
    "deleted file mode",
    "old mode",
    "new mode",
    "similarity index",
    "dissimilarity index",
    "rename from",
    "rename to",
    "copy from",
    "copy to",
    "Binary files",
    "GIT binary patch",
    "\\ No newline",
];

fn continues_diff(line: &str) -> bool {
    // signature delimiter written by git format-patch
    if line == "-- " {
        return false;
    }

    DIFF_PREFIXES.iter().any(|p| line.starts_with(p))
        || line.starts_with('+')
        || line.starts_with('-')
        || line.starts_with(' ')
}
