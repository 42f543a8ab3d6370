/// Splits an incoming byte stream into `\n`-terminated text lines.
///
/// Bytes are decoded incrementally: a multi-byte UTF-8 character split across
/// two chunks is held back until the rest arrives, and invalid sequences are
/// replaced with `U+FFFD`. The text after the last newline is carried over and
/// prefixed to the next chunk, so nothing is ever dropped.
#[derive(Debug, Default)]
pub struct LineFramer {
    undecoded: Vec<u8>,
    partial: String,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes, without the delimiter.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.undecoded.extend_from_slice(chunk);
        let text = self.decode_available();
        self.partial.push_str(&text);

        let Some(last_newline) = self.partial.rfind('\n') else {
            return Vec::new();
        };

        let carry = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, carry);
        complete[..complete.len() - 1]
            .split('\n')
            .map(str::to_owned)
            .collect()
    }

    /// The text received after the last delimiter.
    pub fn pending(&self) -> &str {
        &self.partial
    }

    /// Number of trailing bytes waiting for the rest of a UTF-8 sequence.
    pub fn undecoded_len(&self) -> usize {
        self.undecoded.len()
    }

    /// Drain whatever is left, decoding incomplete bytes lossily.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.undecoded).into_owned();
        self.undecoded.clear();
        let mut rest = std::mem::take(&mut self.partial);
        rest.push_str(&tail);
        rest
    }

    fn decode_available(&mut self) -> String {
        let mut out = String::new();
        let mut consumed = 0;

        loop {
            let remaining = &self.undecoded[consumed..];
            match std::str::from_utf8(remaining) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.undecoded.len();
                    break;
                }
                Err(e) => {
                    let (valid, _) = remaining.split_at(e.valid_up_to());
                    // valid_up_to() guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    consumed += e.valid_up_to();
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += bad;
                        }
                        // truncated sequence at the end of the chunk
                        None => break,
                    }
                }
            }
        }

        self.undecoded.drain(..consumed);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(lines: &[String], carry: &str) -> String {
        let mut out = String::new();
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(carry);
        out
    }

    #[test]
    fn test_complete_lines_in_one_chunk() {
        let mut framer = LineFramer::new();
        let lines = framer.feed(b"1,10,20,30,40,50,60\n2,11,21,31,41,51,61\n");
        assert_eq!(lines, vec!["1,10,20,30,40,50,60", "2,11,21,31,41,51,61"]);
        assert_eq!(framer.pending(), "");
    }

    #[test]
    fn test_partial_line_is_carried_over() {
        let mut framer = LineFramer::new();
        assert!(framer.feed(b"1,10,2").is_empty());
        assert_eq!(framer.pending(), "1,10,2");

        let lines = framer.feed(b"0\n2,1");
        assert_eq!(lines, vec!["1,10,20"]);
        assert_eq!(framer.pending(), "2,1");
    }

    #[test]
    fn test_empty_lines_are_emitted() {
        let mut framer = LineFramer::new();
        let lines = framer.feed(b"\n\nready\n");
        assert_eq!(lines, vec!["", "", "ready"]);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let mut framer = LineFramer::new();
        let text = "µV,42\n".as_bytes();
        // 'µ' is two bytes; split between them
        assert!(framer.feed(&text[..1]).is_empty());
        assert_eq!(framer.undecoded_len(), 1);
        assert_eq!(framer.pending(), "");

        let lines = framer.feed(&text[1..]);
        assert_eq!(lines, vec!["µV,42"]);
        assert_eq!(framer.undecoded_len(), 0);
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut framer = LineFramer::new();
        let lines = framer.feed(b"a\xffb\n");
        assert_eq!(lines, vec!["a\u{FFFD}b"]);
    }

    #[test]
    fn test_reassembly_matches_input_for_any_split() {
        let input = "1,10,20\nboot ok\n2,11,21\n€3,12,22\n4,13";
        let bytes = input.as_bytes();

        for chunk_size in 1..=bytes.len() {
            let mut framer = LineFramer::new();
            let mut lines = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                lines.extend(framer.feed(chunk));
            }
            let carry = framer.finish();
            assert_eq!(reassemble(&lines, &carry), input, "chunk size {chunk_size}");
        }
    }
}
