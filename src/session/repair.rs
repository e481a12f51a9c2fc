//! Pre-call history normalization for providers that demand strict
//! user/assistant alternation.

use crate::platform::{ChatMessage, Role};

const PLACEHOLDER_TEXT: &str = "Please continue.";

/// Splice synthetic user messages into `messages` so that (a) the first
/// message after the system prompt is a user message and (b) no two
/// assistant messages are adjacent.
///
/// This is a deterministic, single-pass mutation based only on the role
/// sequence. It is a normalization step, not a retry.
pub fn repair_alternation(messages: &mut Vec<ChatMessage>) {
    let first_content = messages
        .iter()
        .position(|m| m.role != Role::System);
    if let Some(idx) = first_content {
        if messages[idx].role == Role::Assistant {
            messages.insert(idx, placeholder());
        }
    }

    let mut i = 1;
    while i < messages.len() {
        if messages[i].role == Role::Assistant && messages[i - 1].role == Role::Assistant {
            messages.insert(i, placeholder());
        }
        i += 1;
    }
}

fn placeholder() -> ChatMessage {
    ChatMessage::user(PLACEHOLDER_TEXT)
}
