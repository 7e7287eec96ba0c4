use serde::{Deserialize, Deserializer};

/// Random RFC 4122 v4 id for client-generated sessions and messages.
pub(crate) fn new_local_id() -> String {
    let bytes = fastrand::u128(..).to_le_bytes();
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .hyphenated()
        .to_string()
}

/// Accept ids sent as either JSON strings or numbers. Empty strings and
/// `null` become `None`.
pub(crate) fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
        Uint(u64),
    }

    let raw = Option::<RawId>::deserialize(deserializer)?;
    Ok(match raw {
        Some(RawId::Text(text)) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Some(RawId::Int(n)) => Some(n.to_string()),
        Some(RawId::Uint(n)) => Some(n.to_string()),
        None => None,
    })
}

/// Shorten `text` to at most `max_chars` characters, appending `...` when cut.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}...", text[..cut].trim_end()),
    }
}
