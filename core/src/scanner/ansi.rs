//! Strips ANSI/VT control sequences from the scanner's matching view while
//! the underlying byte stream is left untouched elsewhere.
//!
//! Reuses the `vte` crate, the same parser family `vte_backend.rs` depends
//! on for VT state tracking, but repurposed here to accumulate a
//! plain-text view for rule matching instead of cursor state.

use vte::{Params, Parser, Perform};

struct PlainTextCollector {
    out: Vec<u8>,
}

impl Perform for PlainTextCollector {
    fn print(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        // Only carriage return / line feed matter for line splitting; other
        // control bytes (bell, tab, backspace) carry no textual content.
        if byte == b'\n' || byte == b'\r' {
            self.out.push(byte);
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}
    fn put(&mut self, _byte: u8) {}
    fn unhook(&mut self) {}
    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}
    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}
    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

/// Incremental ANSI stripper — feed it raw bytes, it emits plain text.
pub(crate) struct AnsiStripper {
    parser: Parser,
    collector: PlainTextCollector,
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            collector: PlainTextCollector { out: Vec::new() },
        }
    }

    /// Feeds raw bytes and returns the plain-text bytes extracted from
    /// them (empty if the chunk was entirely control sequences).
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.collector.out.clear();
        self.parser.advance(&mut self.collector, bytes);
        std::mem::take(&mut self.collector.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_color_codes() {
        let mut stripper = AnsiStripper::new();
        let input = b"\x1b[31mhello\x1b[0m world\n";
        let out = stripper.feed(input);
        assert_eq!(String::from_utf8(out).unwrap(), "hello world\n");
    }

    #[test]
    fn preserves_plain_text_unchanged() {
        let mut stripper = AnsiStripper::new();
        let out = stripper.feed(b"let me plan the approach\n");
        assert_eq!(out, b"let me plan the approach\n");
    }
}
