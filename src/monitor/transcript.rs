/// Console output of one monitored run, append only.
#[derive(Debug, Default)]
pub struct Transcript {
    buf: Vec<u8>,
    /// Start of the first line that has not been completely scanned.
    line_start: usize,
    /// Length before the last append.
    prev_len: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.prev_len = self.buf.len();
        self.buf.extend_from_slice(chunk);
    }

    /// Appends bytes that are kept but never scanned for markers. A partial line
    /// before them is not scanned either.
    pub fn append_opaque(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        self.line_start = self.buf.len();
        self.prev_len = self.buf.len();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn since(&self, pos: usize) -> &[u8] {
        &self.buf[pos.min(self.buf.len())..]
    }

    /// Offset of the first line not completely scanned yet.
    pub fn line_start(&self) -> usize {
        self.line_start
    }

    /// Lines touched by the last append, starting at [`line_start`](Self::line_start).
    pub fn unscanned(&self) -> &[u8] {
        &self.buf[self.line_start..]
    }

    /// Bytes a pattern of `pattern_len` bytes may occupy if it ends in the last append.
    pub fn fresh(&self, pattern_len: usize) -> &[u8] {
        let overlap = pattern_len.saturating_sub(1);
        let start = self.prev_len.saturating_sub(overlap).max(self.line_start);
        &self.buf[start..]
    }

    /// Marks everything up to the last newline as scanned.
    pub fn commit_scan(&mut self) {
        if let Some(i) = self.buf[self.line_start..].iter().rposition(|&b| b == b'\n') {
            self.line_start += i + 1;
        }
        self.prev_len = self.buf.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanning_window() {
        let mut t = Transcript::new();
        t.append(b"line one\nexecuting pro");
        assert_eq!(t.unscanned(), b"line one\nexecuting pro");
        t.commit_scan();
        assert_eq!(t.line_start(), 9);

        t.append(b"gram\nnext");
        assert_eq!(t.unscanned(), b"executing program\nnext");
        // a marker ending in the new chunk is visible, an older one is not.
        assert_eq!(t.fresh(b"executing program".len()), b"executing program\nnext");
        assert_eq!(t.fresh(4), b"program\nnext");
        t.commit_scan();
        assert_eq!(t.unscanned(), b"next");
        assert_eq!(t.fresh(17), b"next");
        assert_eq!(t.len(), 31);
    }

    #[test]
    fn opaque_bytes_are_not_scanned() {
        let mut t = Transcript::new();
        t.append(b"ok\n");
        t.commit_scan();
        t.append_opaque(b"BUG: DIAGNOSE\n");
        assert_eq!(t.unscanned(), b"");
        t.append(b"BUG: bad\n");
        assert_eq!(t.line_start(), 17);
        assert_eq!(t.unscanned(), b"BUG: bad\n");
        assert_eq!(t.as_bytes(), b"ok\nBUG: DIAGNOSE\nBUG: bad\n");
    }

    #[test]
    fn since_is_clamped() {
        let mut t = Transcript::new();
        assert!(t.is_empty());
        t.append(b"abc");
        assert_eq!(t.since(1), b"bc");
        assert_eq!(t.since(10), b"");
        assert_eq!(t.as_bytes(), b"abc");
    }
}
