//! Logging utilities for sanitizing player messages and interpreter output so logs stay single-line.
//! Escapes control characters that otherwise break log readability.

use crate::engine::types::{MutationKind, MutationTarget, StateMutation};

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Compact one-line summary of a mutation batch, e.g.
/// `player:append:player.inventory, world:remove:locations.counter.items`.
pub fn summarize_mutations(ops: &[StateMutation]) -> String {
    if ops.is_empty() {
        return "-".to_string();
    }
    let parts: Vec<String> = ops
        .iter()
        .map(|op| {
            let target = match op.target {
                MutationTarget::Player => "player",
                MutationTarget::World => "world",
            };
            let kind = match op.operation {
                MutationKind::Append => "append",
                MutationKind::Remove => "remove",
                MutationKind::Set => "set",
            };
            format!("{}:{}:{}", target, kind, op.path)
        })
        .collect();
    escape_log(&parts.join(", "))
}
