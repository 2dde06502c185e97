//! Line reassembly across output chunks
//!
//! Remote output arrives in arbitrary byte chunks that may cut a line, a
//! UTF-8 sequence or a CRLF in half. The assembler releases text only up to
//! the last newline and carries the rest to the next chunk; the session loop
//! flushes the carry after a quiet period so prompts without a trailing
//! newline still reach the thread.

/// Partial lines above this size are released without waiting for a newline
const MAX_PARTIAL_BYTES: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every complete line it finished, newline included
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_nl) = self.pending.iter().rposition(|b| *b == b'\n') else {
            self.collapse_redraws();
            if self.pending.len() > MAX_PARTIAL_BYTES {
                return self.flush();
            }
            return None;
        };

        let complete: Vec<u8> = self.pending.drain(..=last_nl).collect();
        self.collapse_redraws();
        Some(String::from_utf8_lossy(&complete).into_owned())
    }

    /// Release the carried partial line, if any
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    /// A spinner redrawing with bare CRs never sends a newline; only the last
    /// draw of the carried line matters. A final CR is kept since it may be
    /// the first half of a CRLF.
    fn collapse_redraws(&mut self) {
        let len = self.pending.len();
        if len < 2 {
            return;
        }
        if let Some(cr) = self.pending[..len - 1].iter().rposition(|b| *b == b'\r') {
            if cr > 0 {
                self.pending.drain(..cr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carries_partial_line() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(b"hello wo"), None);
        assert!(asm.has_partial());
        assert_eq!(asm.push(b"rld\nnext"), Some("hello world\n".to_string()));
        assert_eq!(asm.flush(), Some("next".to_string()));
        assert!(!asm.has_partial());
        assert_eq!(asm.flush(), None);
    }

    #[test]
    fn test_split_utf8_sequence() {
        let mut asm = LineAssembler::new();
        let bytes = "done❯\n".as_bytes();
        // Cut inside the three-byte prompt glyph
        assert_eq!(asm.push(&bytes[..5]), None);
        assert_eq!(asm.push(&bytes[5..]), Some("done❯\n".to_string()));
    }

    #[test]
    fn test_split_crlf_is_preserved() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(b"line\r"), None);
        assert_eq!(asm.push(b"\nrest"), Some("line\r\n".to_string()));
    }

    #[test]
    fn test_spinner_redraws_do_not_accumulate() {
        let mut asm = LineAssembler::new();
        for i in 0..100 {
            assert_eq!(asm.push(format!("\r✻ Working… ({}s)", i).as_bytes()), None);
        }
        assert_eq!(asm.flush(), Some("\r✻ Working… (99s)".to_string()));
    }
}
