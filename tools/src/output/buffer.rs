//! Bounded output buffers and byte-to-line assembly

use super::OutputChannel;

/// Lines longer than this are emitted in pieces
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

/// Captured stdout and stderr with a shared ceiling
#[derive(Debug)]
pub(crate) struct OutputBuffers {
    stdout: String,
    stderr: String,
    ceiling: usize,
    discarded: usize,
}

impl OutputBuffers {
    pub fn new(ceiling: usize) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            ceiling,
            discarded: 0,
        }
    }

    /// Append text, truncating from the front when over the ceiling
    ///
    /// Returns the number of bytes discarded by this call.
    pub fn append(&mut self, channel: OutputChannel, text: &str) -> usize {
        match channel {
            OutputChannel::Stdout => self.stdout.push_str(text),
            OutputChannel::Stderr => self.stderr.push_str(text),
        }
        if self.total() <= self.ceiling {
            return 0;
        }

        let half = self.ceiling / 2;
        let discarded = truncate_front(&mut self.stdout, half) + truncate_front(&mut self.stderr, half);
        self.discarded += discarded;
        discarded
    }

    pub fn get(&self, channel: OutputChannel) -> &str {
        match channel {
            OutputChannel::Stdout => &self.stdout,
            OutputChannel::Stderr => &self.stderr,
        }
    }

    pub fn total(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    /// Bytes discarded over the handler's lifetime
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

/// Keep at most `keep` trailing bytes, cutting on a char boundary
fn truncate_front(buffer: &mut String, keep: usize) -> usize {
    if buffer.len() <= keep {
        return 0;
    }
    let mut cut = buffer.len() - keep;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    buffer.drain(..cut);
    cut
}

/// Incremental UTF-8 decoding across chunk boundaries
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, invalid) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &invalid[len..];
                        }
                        // Incomplete sequence at the end of the chunk
                        None => {
                            self.carry = invalid.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left at end of stream
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}

/// Splits decoded text into complete lines
#[derive(Debug, Default)]
pub(crate) struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            self.partial.push_str(&rest[..pos]);
            lines.push(take_line(&mut self.partial));
            rest = &rest[pos + 1..];
        }
        self.partial.push_str(rest);
        if self.partial.len() > MAX_LINE_BYTES {
            lines.push(std::mem::take(&mut self.partial));
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(take_line(&mut self.partial))
        }
    }
}

fn take_line(partial: &mut String) -> String {
    let mut line = std::mem::take(partial);
    if line.ends_with('\r') {
        line.pop();
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_respect_ceiling() {
        let mut buffers = OutputBuffers::new(100);
        assert_eq!(buffers.append(OutputChannel::Stdout, &"a".repeat(60)), 0);
        let discarded = buffers.append(OutputChannel::Stderr, &"b".repeat(60));
        assert_eq!(discarded, 20);
        assert!(buffers.total() <= 100);
        assert_eq!(buffers.get(OutputChannel::Stdout).len(), 50);
        assert_eq!(buffers.get(OutputChannel::Stderr).len(), 50);

        buffers.append(OutputChannel::Stdout, &"c".repeat(500));
        assert!(buffers.total() <= 100);
        // Most recent output survives
        assert!(buffers.get(OutputChannel::Stdout).ends_with("ccc"));
        assert_eq!(buffers.discarded(), 20 + 500);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut text = "ééééé".to_string(); // 10 bytes
        let removed = truncate_front(&mut text, 3);
        assert_eq!(text, "é");
        assert_eq!(removed, 8);
    }

    #[test]
    fn test_decoder_carries_split_sequences() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8Decoder::default();
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(second, "éllo");

        assert_eq!(decoder.decode(&[b'a', 0xff, b'b']), "a\u{fffd}b");
        decoder.decode(&[0xc3]);
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn test_line_assembler() {
        let mut lines = LineAssembler::default();
        assert_eq!(lines.push("one\r\ntw"), vec!["one".to_string()]);
        assert_eq!(lines.push("o\nthree"), vec!["two".to_string()]);
        assert_eq!(lines.finish(), Some("three".to_string()));
        assert_eq!(lines.finish(), None);
    }
}
