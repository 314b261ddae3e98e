//! Read-time shape annotations for one thread's forest.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::types::StoredMessage;

/// Deepest render level; deeper branches stay at this level.
pub const MAX_RENDER_DEPTH: usize = 3;

/// One node of the annotated forest, in depth-first order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeNode {
    pub identity: String,
    pub parent: Option<String>,
    /// Real distance from the structural root.
    pub depth: usize,
    /// Depth with linear runs collapsed: only branching indents.
    pub render_depth: usize,
    pub children: usize,
    /// Strictly inside a single-reply chain.
    pub flattenable: bool,
    pub is_last_sibling: bool,
}

/// Annotate the forest of one thread.
///
/// Roots and siblings are ordered by sent time, then identity. Messages
/// whose parent is outside `messages` are treated as roots.
pub fn annotate(messages: &[StoredMessage]) -> Vec<ShapeNode> {
    if messages.is_empty() {
        return Vec::new();
    }

    let by_id: HashMap<&str, &StoredMessage> =
        messages.iter().map(|m| (m.identity(), m)).collect();

    let mut children: HashMap<&str, Vec<&StoredMessage>> = HashMap::new();
    let mut roots = Vec::new();
    for msg in messages {
        match msg.parent.as_deref().filter(|p| by_id.contains_key(p)) {
            Some(parent) => children.entry(parent).or_default().push(msg),
            None => roots.push(msg),
        }
    }

    let order = |m: &&StoredMessage| (m.envelope.sent_at, m.identity().to_string());
    roots.sort_by_key(order);
    for kids in children.values_mut() {
        kids.sort_by_key(order);
    }

    let child_count = |id: &str| children.get(id).map_or(0, Vec::len);

    // (message, depth, render depth, is last sibling)
    let mut stack: Vec<(&StoredMessage, usize, usize, bool)> = roots
        .iter()
        .enumerate()
        .rev()
        .map(|(i, m)| (*m, 0, 0, i == roots.len() - 1))
        .collect();

    let mut visited = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    while let Some((msg, depth, render_depth, is_last_sibling)) = stack.pop() {
        if !visited.insert(msg.identity()) {
            continue;
        }

        let kids = children.get(msg.identity()).map_or(&[][..], Vec::as_slice);
        let branching = kids.len() > 1;
        for (i, kid) in kids.iter().enumerate().rev() {
            let kid_render = if branching {
                (render_depth + 1).min(MAX_RENDER_DEPTH)
            } else {
                render_depth.max(1)
            };
            stack.push((*kid, depth + 1, kid_render, i == kids.len() - 1));
        }

        let parent = msg.parent.as_deref().filter(|p| by_id.contains_key(p));
        let flattenable = kids.len() == 1 && parent.is_some_and(|p| child_count(p) == 1);

        out.push(ShapeNode {
            identity: msg.identity().to_string(),
            parent: parent.map(str::to_string),
            depth,
            render_depth,
            children: kids.len(),
            flattenable,
            is_last_sibling,
        });
    }

    out
}

/// Box-drawing prefix for a node at `render_depth`.
pub fn tree_prefix(render_depth: usize, is_last_sibling: bool) -> String {
    if render_depth == 0 {
        return String::new();
    }

    let mut prefix = "│  ".repeat(render_depth - 1);
    prefix.push_str(if is_last_sibling { "└─ " } else { "├─ " });
    prefix
}
