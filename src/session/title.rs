use super::Message;
use crate::util::truncate_chars;

pub const DEFAULT_TITLE: &str = "New conversation";
const MAX_TITLE_CHARS: usize = 30;

/// Title for a conversation: the latest user-authored message, whitespace
/// collapsed and shortened. `None` when the user has not said anything.
#[must_use]
pub fn derive_title(messages: &[Message]) -> Option<String> {
    let last_user = messages.iter().rev().find(|m| m.is_user)?;
    let collapsed = last_user.content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(truncate_chars(&collapsed, MAX_TITLE_CHARS))
}

/// Normalize a title coming from the backend.
#[must_use]
pub fn normalize_title(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(title) if !title.is_empty() => title.to_string(),
        _ => DEFAULT_TITLE.to_string(),
    }
}
