//! Byte stream to text line assembly.

/// Longest partial line kept while waiting for a terminator.
pub const MAX_LINE_LEN: usize = 4096;

/// Splits received bytes into trimmed text lines.
///
/// Decoding is lossy: invalid UTF-8 becomes `�`, never an error. Blank lines
/// are dropped. A partial line that grows past [`MAX_LINE_LEN`] without a
/// newline is emitted as-is.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning every line completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                self.flush_into(&mut lines);
            } else {
                self.buffer.push(byte);
                if self.buffer.len() >= MAX_LINE_LEN {
                    self.flush_into(&mut lines);
                }
            }
        }
        lines
    }

    /// Drop any partial line, e.g. after the connection was lost.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        let text = String::from_utf8_lossy(&self.buffer);
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
        self.buffer.clear();
    }
}
