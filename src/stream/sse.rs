/// Event-stream record decoder.
///
/// Splits the accumulating text of a `text/event-stream` response into
/// complete records on the blank-line delimiter. The unterminated tail is
/// kept for the next read, so a record (or the delimiter itself) may be split
/// across any number of network reads.
use memchr::memmem;
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Delimiter search
// ---------------------------------------------------------------------------

/// Blank-line delimiters: any two consecutive line endings, where a line
/// ending is `\n` or `\r\n`.
const RECORD_TERMINATORS: [&[u8]; 4] = [b"\n\n", b"\r\n\r\n", b"\n\r\n", b"\r\n\n"];

#[inline]
fn find_record_terminator_from(buffer: &[u8], scan_from: usize) -> Option<(usize, usize)> {
    static FINDERS: LazyLock<[memmem::Finder<'static>; 4]> =
        LazyLock::new(|| RECORD_TERMINATORS.map(memmem::Finder::new));

    let scan_from = scan_from.min(buffer.len());
    let haystack = &buffer[scan_from..];
    // Earliest match wins; on a tie the longer delimiter wins.
    FINDERS
        .iter()
        .filter_map(|finder| {
            finder
                .find(haystack)
                .map(|rel| (scan_from + rel, finder.needle().len()))
        })
        .min_by_key(|&(pos, len)| (pos, std::cmp::Reverse(len)))
}

/// Split `buffer` into complete records and the unterminated remainder.
///
/// Records are returned without their delimiter. Blank records (two
/// delimiters in a row) are skipped.
#[must_use]
pub fn split_records(buffer: &str) -> (Vec<&str>, &str) {
    let mut records = Vec::new();
    let mut start = 0usize;
    while let Some((pos, len)) = find_record_terminator_from(&buffer.as_bytes()[start..], 0) {
        let record = &buffer[start..start + pos];
        if !record.trim().is_empty() {
            records.push(record);
        }
        start += pos + len;
    }
    (records, &buffer[start..])
}

// ---------------------------------------------------------------------------
// RecordDecoder: stateful wrapper used by the read loop
// ---------------------------------------------------------------------------

/// Incremental record splitter.
///
/// Feed it text as it arrives; it yields every record completed so far and
/// keeps the partial tail buffered.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buffer: String,
    scan_from: usize,
}

impl RecordDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text and return any records completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed text and append completed records into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<String>) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.push_str(chunk);

        let mut consumed = 0usize;
        let mut scan_from = self.scan_from;
        while let Some((pos, len)) =
            find_record_terminator_from(&self.buffer.as_bytes()[consumed..], scan_from)
        {
            let record = &self.buffer[consumed..consumed + pos];
            if !record.trim().is_empty() {
                out.push(record.to_owned());
            }
            consumed += pos + len;
            scan_from = 0;
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        // A delimiter may straddle this read and the next one: rescan the
        // last three bytes next time.
        self.scan_from = self.buffer.len().saturating_sub(3);
    }

    /// Unterminated text buffered so far.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Take the buffered tail at end of stream.
    ///
    /// The protocol does not guarantee a trailing delimiter, so the last
    /// record may still be sitting here.
    pub fn finish(&mut self) -> Option<String> {
        self.scan_from = 0;
        let tail = std::mem::take(&mut self.buffer);
        if tail.trim().is_empty() {
            None
        } else {
            Some(tail)
        }
    }
}

// ---------------------------------------------------------------------------
// Utf8Decoder: byte front end
// ---------------------------------------------------------------------------

/// Decodes network bytes into text, carrying incomplete multi-byte sequences
/// over to the next read. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        if self.pending.is_empty() {
            if let Ok(text) = std::str::from_utf8(bytes) {
                return text.to_owned();
            }
        }

        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    if let Some(invalid_len) = err.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        self.pending.drain(..valid_up_to + invalid_len);
                    } else {
                        // Incomplete sequence at the end: wait for more bytes.
                        self.pending.drain(..valid_up_to);
                        break;
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_records_keeps_tail() {
        let (records, tail) = split_records("data: a\n\ndata: b\n\ndata: c");
        assert_eq!(records, vec!["data: a", "data: b"]);
        assert_eq!(tail, "data: c");
    }

    #[test]
    fn test_split_records_crlf() {
        let (records, tail) = split_records("data: a\r\n\r\ndata: b\n\n");
        assert_eq!(records, vec!["data: a", "data: b"]);
        assert_eq!(tail, "");
    }

    #[test]
    fn test_split_records_mixed_line_endings() {
        let (records, tail) = split_records("data: a\n\r\ndata: b\r\n\ndata: c\r\n\r\n");
        assert_eq!(records, vec!["data: a", "data: b", "data: c"]);
        assert_eq!(tail, "");
    }

    #[test]
    fn test_decoder_mixed_delimiter_split_across_reads() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder.feed("data: a\r\n").is_empty());
        assert_eq!(decoder.feed("\ndata: b\n"), vec!["data: a".to_string()]);
        assert_eq!(decoder.feed("\r\n"), vec!["data: b".to_string()]);
    }

    #[test]
    fn test_split_records_skips_blank_records() {
        let (records, tail) = split_records("\n\n\n\ndata: x\n\n");
        assert_eq!(records, vec!["data: x"]);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_decoder_partial_record_across_reads() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder.feed("data: {\"chunk\":\"He").is_empty());
        assert_eq!(decoder.pending(), "data: {\"chunk\":\"He");
        let records = decoder.feed("l\"}\n\n");
        assert_eq!(records, vec!["data: {\"chunk\":\"Hel\"}".to_string()]);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_decoder_delimiter_split_across_reads() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder.feed("data: a\n").is_empty());
        let records = decoder.feed("\ndata: b\n");
        assert_eq!(records, vec!["data: a".to_string()]);
        let records = decoder.feed("\n");
        assert_eq!(records, vec!["data: b".to_string()]);
    }

    #[test]
    fn test_decoder_crlf_delimiter_split_byte_by_byte() {
        let mut decoder = RecordDecoder::new();
        let mut records = Vec::new();
        for ch in "data: a\r\n\r\ndata: b\r\n\r\n".chars() {
            decoder.feed_into(&ch.to_string(), &mut records);
        }
        assert_eq!(records, vec!["data: a".to_string(), "data: b".to_string()]);
    }

    #[test]
    fn test_decoder_finish_returns_unterminated_tail() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder.feed("data: {\"chunk\":\"end\"}").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("data: {\"chunk\":\"end\"}"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_finish_ignores_whitespace_tail() {
        let mut decoder = RecordDecoder::new();
        decoder.feed("data: a\n\n\n");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_utf8_decoder_carries_split_sequence() {
        let text = "录取";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Decoder::new();
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..4]);
        let third = decoder.decode(&bytes[4..]);
        assert_eq!(format!("{first}{second}{third}"), text);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        let out = decoder.decode(b"ok\xffok");
        assert_eq!(out, "ok\u{FFFD}ok");
    }

    #[test]
    fn test_utf8_decoder_finish_flushes_truncated_sequence() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&"é".as_bytes()[..1]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
