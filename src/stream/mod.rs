pub mod payload;
pub mod sse;

pub use payload::{parse_record, StreamFragment};
pub use sse::{split_records, RecordDecoder, Utf8Decoder};

/// Byte-to-fragment pipeline for one streamed response.
///
/// Owns the UTF-8 front end and the record splitter; every completed record
/// goes through [`parse_record`]. The fragment sequence is the same no
/// matter how the bytes were split across reads.
#[derive(Debug, Default)]
pub struct FragmentDecoder {
    utf8: Utf8Decoder,
    records: RecordDecoder,
    scratch: Vec<String>,
}

impl FragmentDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read and return the fragments it completed.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<StreamFragment> {
        let text = self.utf8.decode(bytes);
        self.push_text(&text)
    }

    /// Feed already-decoded text.
    pub fn push_text(&mut self, text: &str) -> Vec<StreamFragment> {
        self.records.feed_into(text, &mut self.scratch);
        self.scratch
            .drain(..)
            .filter_map(|record| parse_record(&record))
            .collect()
    }

    /// End of stream: flush buffered bytes and the unterminated tail.
    pub fn finish(&mut self) -> Vec<StreamFragment> {
        let tail_text = self.utf8.finish();
        let mut out = self.push_text(&tail_text);
        if let Some(tail) = self.records.finish() {
            out.extend(parse_record(&tail));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        "data: {\"chunk\":\"Hel\"}\n\n",
        "data: {\"chunk\":\"lo, \",\"conversation_id\":\"c-1\"}\n\n",
        "data: not json at all\n\n",
        "event: ping\n\n",
        "data: {\"answer\":\"wörld\"}\r\n\r\n",
        "data: {\"message_id\":\"m-1\"}"
    );

    fn decode_in_chunks(input: &[u8], sizes: &[usize]) -> Vec<StreamFragment> {
        let mut decoder = FragmentDecoder::new();
        let mut out = Vec::new();
        let mut offset = 0;
        let mut size_iter = sizes.iter().cycle();
        while offset < input.len() {
            let size = (*size_iter.next().unwrap()).max(1);
            let end = (offset + size).min(input.len());
            out.extend(decoder.push_bytes(&input[offset..end]));
            offset = end;
        }
        out.extend(decoder.finish());
        out
    }

    #[test]
    fn test_chunking_invariance() {
        let whole = decode_in_chunks(STREAM.as_bytes(), &[STREAM.len()]);
        assert_eq!(whole.len(), 4);
        assert_eq!(whole[0].text, "Hel");
        assert_eq!(whole[1].conversation_id.as_deref(), Some("c-1"));
        assert_eq!(whole[2].text, "wörld");
        assert_eq!(whole[3].message_id.as_deref(), Some("m-1"));

        for sizes in [&[1][..], &[2], &[3, 7], &[5, 1, 11], &[13], &[64, 2]] {
            assert_eq!(decode_in_chunks(STREAM.as_bytes(), sizes), whole, "sizes={sizes:?}");
        }
    }

    #[test]
    fn test_malformed_record_does_not_halt_stream() {
        let input = "data: {bad\n\ndata: {\"chunk\":\"after\"}\n\n";
        let fragments = decode_in_chunks(input.as_bytes(), &[4]);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, "after");
    }
}
