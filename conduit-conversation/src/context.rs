//! Context assembly for continued conversations.
//!
//! Two orders are in play. File and image references are deduplicated
//! newest-first, so a path mentioned by several turns is only embedded once
//! from its most recent mention. The history text is always chronological and
//! every turn keeps the file list it was recorded with.

use std::collections::HashSet;
use std::fmt::Write as _;

use conduit_common::util::{estimate_tokens, truncate_with_ellipsis};

use crate::types::{Turn, TurnRole};

/// A deduplicated reference and the turn that contributed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    pub path: String,
    /// Index into the turn slice the reference was collected from.
    pub turn_index: usize,
}

fn collect_newest_first<'a, F>(turns: &'a [Turn], refs: F) -> Vec<FileReference>
where
    F: Fn(&'a Turn) -> &'a [String],
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for (turn_index, turn) in turns.iter().enumerate().rev() {
        for path in refs(turn) {
            if seen.insert(path.as_str()) {
                out.push(FileReference {
                    path: path.clone(),
                    turn_index,
                });
            }
        }
    }
    out
}

/// Unique file paths across `turns`, newest mention first.
pub fn collect_file_references(turns: &[Turn]) -> Vec<FileReference> {
    collect_newest_first(turns, |turn| turn.files.as_slice())
}

/// Unique image references across `turns`, newest mention first.
pub fn collect_image_references(turns: &[Turn]) -> Vec<FileReference> {
    collect_newest_first(turns, |turn| turn.images.as_slice())
}

/// Rendered conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHistory {
    pub text: String,
    pub included_turns: usize,
    pub omitted_turns: usize,
    /// The newest turn alone exceeded the budget and was cut short.
    pub newest_truncated: bool,
    pub estimated_tokens: usize,
}

fn render_turn(number: usize, turn: &Turn) -> String {
    let mut block = String::new();
    let author = match turn.role {
        TurnRole::Agent => "Agent",
        TurnRole::Tool => "Tool",
    };

    let _ = write!(block, "--- Turn {number} ({author}");
    if let Some(tool) = &turn.tool_name {
        let _ = write!(block, " using {tool}");
    }
    if let Some(model) = &turn.model_name {
        let _ = write!(block, " via {model}");
    }
    block.push_str(") ---\n");

    if !turn.files.is_empty() {
        let _ = writeln!(block, "Files used in this turn: {}", turn.files.join(", "));
    }
    block.push_str(&turn.content);
    block.push_str("\n\n");
    block
}

/// Render `turns` as a history block within `token_budget`.
///
/// Turns are selected from the newest backwards until the next one would not
/// fit, then presented oldest-first. Turn numbers refer to positions in the
/// full slice so omitted turns leave a visible gap. The newest turn is always
/// included; when it alone exceeds the budget its content is truncated.
pub fn build_history(turns: &[Turn], token_budget: usize) -> ConversationHistory {
    if turns.is_empty() {
        return ConversationHistory {
            text: String::new(),
            included_turns: 0,
            omitted_turns: 0,
            newest_truncated: false,
            estimated_tokens: 0,
        };
    }

    let mut selected: Vec<String> = Vec::new();
    let mut used = 0usize;
    let mut newest_truncated = false;

    for (index, turn) in turns.iter().enumerate().rev() {
        let block = render_turn(index + 1, turn);
        let cost = estimate_tokens(&block);
        if used.saturating_add(cost) > token_budget {
            if selected.is_empty() {
                let mut shortened = turn.clone();
                shortened.content =
                    truncate_with_ellipsis(&turn.content, token_budget.saturating_mul(4));
                selected.push(render_turn(index + 1, &shortened));
                newest_truncated = true;
            }
            break;
        }
        used += cost;
        selected.push(block);
    }

    let included_turns = selected.len();
    let omitted_turns = turns.len() - included_turns;

    let mut text = String::from("=== CONVERSATION HISTORY ===\n");
    let _ = writeln!(text, "Showing {included_turns} of {} turns", turns.len());
    if omitted_turns > 0 {
        let _ = writeln!(
            text,
            "[{omitted_turns} earlier turns omitted to fit the history budget]"
        );
    }
    if newest_truncated {
        text.push_str("[latest turn truncated to fit the history budget]\n");
    }
    text.push('\n');
    for block in selected.iter().rev() {
        text.push_str(block);
    }
    text.push_str("=== END CONVERSATION HISTORY ===\n");

    ConversationHistory {
        estimated_tokens: estimate_tokens(&text),
        text,
        included_turns,
        omitted_turns,
        newest_truncated,
    }
}
