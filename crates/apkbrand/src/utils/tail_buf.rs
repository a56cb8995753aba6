use std::collections::VecDeque;
use std::io::Write;

/// Number of trailing lines kept from each stream of an external tool.
pub const TAIL_LINES: usize = 60;

/// Longest line kept, in bytes. Longer lines keep their end.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// An in-memory sink that only remembers the last `limit` lines written to it.
///
/// Implements `Write` so it can be fed raw process output. Bytes are decoded
/// lossily, so tools that print invalid UTF-8 still leave a readable tail.
#[derive(Debug)]
pub struct TailBuf {
    lines: VecDeque<String>,
    partial: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl TailBuf {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit.min(TAIL_LINES)),
            partial: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    /// Lines discarded because they fell out of the window.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Renders the retained lines, including an unterminated last line.
    pub fn contents(&self) -> String {
        let mut out: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            out.push(String::from_utf8_lossy(&self.partial).into_owned());
        }

        let skip = out.len().saturating_sub(self.limit);
        out[skip..].join("\n")
    }

    fn push_line(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let raw = &raw[raw.len().saturating_sub(MAX_LINE_BYTES)..];
        self.lines.push_back(String::from_utf8_lossy(raw).into_owned());

        while self.lines.len() > self.limit {
            self.lines.pop_front();
            self.dropped += 1;
        }
    }
}

impl Write for TailBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut rest = buf;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            if self.partial.is_empty() {
                self.push_line(line);
            } else {
                let mut joined = std::mem::take(&mut self.partial);
                joined.extend_from_slice(line);
                self.push_line(&joined);
            }
            rest = &tail[1..];
        }

        self.partial.extend_from_slice(rest);
        // `\r`-only progress output never ends a line
        if self.partial.len() > MAX_LINE_BYTES {
            let excess = self.partial.len() - MAX_LINE_BYTES;
            self.partial.drain(..excess);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Default for TailBuf {
    fn default() -> Self {
        Self::new(TAIL_LINES)
    }
}
