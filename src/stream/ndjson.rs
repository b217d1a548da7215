/// Incremental NDJSON line splitting.
///
/// Upstream bodies arrive as arbitrary byte chunks; a multi-byte UTF-8
/// sequence or a JSON line may straddle any read boundary. The splitter
/// keeps the undecodable byte tail and the unterminated line tail between
/// feeds so no boundary can corrupt or drop data.
use memchr::memchr_iter;

pub struct NdjsonLineSplitter {
    buffer: String,
    remainder: Vec<u8>,
}

impl NdjsonLineSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            remainder: Vec::new(),
        }
    }

    /// Feed raw bytes, appending complete lines (without the terminator)
    /// into `out`.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<String>) {
        if self.remainder.is_empty() {
            match std::str::from_utf8(bytes) {
                Ok(text) => self.buffer.push_str(text),
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                    let text = unsafe { std::str::from_utf8_unchecked(&bytes[..valid_up_to]) };
                    self.buffer.push_str(text);
                    self.remainder.extend_from_slice(&bytes[valid_up_to..]);
                }
            }
        } else {
            self.remainder.extend_from_slice(bytes);
            match std::str::from_utf8(&self.remainder) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.remainder.clear();
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                    let text =
                        unsafe { std::str::from_utf8_unchecked(&self.remainder[..valid_up_to]) };
                    self.buffer.push_str(text);
                    if valid_up_to > 0 {
                        let remain_len = self.remainder.len() - valid_up_to;
                        self.remainder.copy_within(valid_up_to.., 0);
                        self.remainder.truncate(remain_len);
                    }
                }
            }
        }

        let mut consumed = 0usize;
        {
            let bytes = self.buffer.as_bytes();
            for pos in memchr_iter(b'\n', bytes) {
                let mut line = &self.buffer[consumed..pos];
                if let Some(stripped) = line.strip_suffix('\r') {
                    line = stripped;
                }
                out.push(line.to_string());
                consumed = pos + 1;
            }
        }
        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
    }

    /// Take the trailing unterminated line, if any. Undecodable trailing
    /// bytes are dropped; a truncated UTF-8 sequence cannot be part of a
    /// valid JSON line anyway.
    pub fn finish(&mut self) -> Option<String> {
        self.remainder.clear();
        if self.buffer.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buffer);
        if line.ends_with('\r') {
            line.pop();
        }
        (!line.is_empty()).then_some(line)
    }
}

impl Default for NdjsonLineSplitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(splitter: &mut NdjsonLineSplitter, chunks: &[&[u8]]) -> Vec<String> {
        let mut out = Vec::new();
        for chunk in chunks {
            splitter.feed(chunk, &mut out);
        }
        if let Some(tail) = splitter.finish() {
            out.push(tail);
        }
        out
    }

    #[test]
    fn splits_lines_within_one_chunk() {
        let mut splitter = NdjsonLineSplitter::new();
        let lines = feed_all(&mut splitter, &[b"{\"a\":1}\n{\"b\":2}\n"]);
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn joins_lines_across_chunks() {
        let mut splitter = NdjsonLineSplitter::new();
        let lines = feed_all(&mut splitter, &[b"{\"a\"", b":1}\n{\"b\"", b":2}\n"]);
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn strips_crlf_terminators() {
        let mut splitter = NdjsonLineSplitter::new();
        let lines = feed_all(&mut splitter, &[b"{\"a\":1}\r\n"]);
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn multibyte_utf8_survives_any_split() {
        let text = "{\"token\":\"视频已生成\"}\n";
        let bytes = text.as_bytes();
        for split in 1..bytes.len() {
            let mut splitter = NdjsonLineSplitter::new();
            let lines = feed_all(&mut splitter, &[&bytes[..split], &bytes[split..]]);
            assert_eq!(lines, vec!["{\"token\":\"视频已生成\"}"], "split at {split}");
        }
    }

    #[test]
    fn finish_returns_unterminated_tail() {
        let mut splitter = NdjsonLineSplitter::new();
        let mut out = Vec::new();
        splitter.feed(b"{\"a\":1}\n{\"tail\":", &mut out);
        assert_eq!(out, vec!["{\"a\":1}"]);
        assert_eq!(splitter.finish().as_deref(), Some("{\"tail\":"));
        assert_eq!(splitter.finish(), None);
    }
}
