use serde_json::Value;

/// One incremental piece of assistant output decoded from a single record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFragment {
    pub text: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
}

impl StreamFragment {
    #[must_use]
    pub fn has_text(&self) -> bool {
        !self.text.is_empty()
    }
}

/// Field names probed for the text fragment, in priority order. Providers
/// have renamed this field across response variants.
const TEXT_FIELDS: [&str; 3] = ["chunk", "answer", "text"];

/// Collect the `data:` segment of one record.
///
/// Multiple `data:` lines are joined with `\n`; every other field is ignored.
#[must_use]
pub fn extract_data(record: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in record.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => data = Some(value.to_owned()),
        }
    }
    data
}

/// Decode one complete record into a fragment.
///
/// A record that fails to decode is logged and skipped so one malformed
/// record never poisons the rest of the response.
#[must_use]
pub fn parse_record(record: &str) -> Option<StreamFragment> {
    let data = extract_data(record)?;
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    let payload: Value = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, record = %truncate_for_log(data), "skipping undecodable stream record");
            return None;
        }
    };
    fragment_from_payload(&payload)
}

fn fragment_from_payload(payload: &Value) -> Option<StreamFragment> {
    let Some(object) = payload.as_object() else {
        tracing::debug!("ignoring non-object stream payload");
        return None;
    };

    let text = TEXT_FIELDS
        .iter()
        .filter_map(|field| object.get(*field).and_then(Value::as_str))
        .find(|value| !value.is_empty())
        .unwrap_or_default()
        .to_owned();
    let conversation_id = non_empty_str(object.get("conversation_id"));
    let message_id = non_empty_str(object.get("message_id"));

    if text.is_empty() && conversation_id.is_none() && message_id.is_none() {
        return None;
    }
    Some(StreamFragment {
        text,
        conversation_id,
        message_id,
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn truncate_for_log(data: &str) -> &str {
    const MAX_LEN: usize = 200;
    if data.len() <= MAX_LEN {
        return data;
    }
    let mut end = MAX_LEN;
    while !data.is_char_boundary(end) {
        end -= 1;
    }
    &data[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chunk_field() {
        let fragment = parse_record("data: {\"chunk\":\"Hel\"}").unwrap();
        assert_eq!(fragment.text, "Hel");
        assert!(fragment.conversation_id.is_none());
    }

    #[test]
    fn test_field_priority_chunk_then_answer_then_text() {
        let fragment =
            parse_record(r#"data: {"chunk":"","answer":"from-answer","text":"from-text"}"#)
                .unwrap();
        assert_eq!(fragment.text, "from-answer");

        let fragment = parse_record(r#"data: {"text":"from-text"}"#).unwrap();
        assert_eq!(fragment.text, "from-text");

        let fragment = parse_record(r#"data: {"chunk":"c","answer":"a"}"#).unwrap();
        assert_eq!(fragment.text, "c");
    }

    #[test]
    fn test_metadata_without_text() {
        let fragment = parse_record(
            r#"data: {"event":"message_end","conversation_id":"conv-1","message_id":"msg-9"}"#,
        )
        .unwrap();
        assert!(!fragment.has_text());
        assert_eq!(fragment.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(fragment.message_id.as_deref(), Some("msg-9"));
    }

    #[test]
    fn test_malformed_record_is_no_fragment() {
        assert!(parse_record("data: {\"chunk\":").is_none());
    }

    #[test]
    fn test_non_data_fields_ignored() {
        let fragment =
            parse_record("event: message\nid: 7\n: keep-alive\ndata: {\"answer\":\"hi\"}").unwrap();
        assert_eq!(fragment.text, "hi");
    }

    #[test]
    fn test_record_without_data_is_none() {
        assert!(parse_record("event: ping").is_none());
        assert!(parse_record(": comment").is_none());
    }

    #[test]
    fn test_done_marker_is_none() {
        assert!(parse_record("data: [DONE]").is_none());
    }

    #[test]
    fn test_empty_object_is_none() {
        assert!(parse_record("data: {}").is_none());
        assert!(parse_record(r#"data: {"conversation_id":""}"#).is_none());
    }

    #[test]
    fn test_multiline_data_joined() {
        assert_eq!(
            extract_data("data: {\"chunk\":\ndata: \"x\"}").as_deref(),
            Some("{\"chunk\":\n\"x\"}")
        );
        let fragment = parse_record("data: {\"chunk\":\ndata: \"x\"}").unwrap();
        assert_eq!(fragment.text, "x");
    }

    #[test]
    fn test_data_without_space_after_colon() {
        let fragment = parse_record("data:{\"chunk\":\"tight\"}").unwrap();
        assert_eq!(fragment.text, "tight");
    }
}
