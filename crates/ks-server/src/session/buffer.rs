//! Bounded accumulator for shell output.
//!
//! Each session keeps the raw text the remote shell produced, capped at a
//! fixed byte ceiling. When an append would cross the ceiling the whole
//! buffer is dropped first, so the newest fragment always survives. Bulk
//! reset is the contract here — this is deliberately not a ring buffer
//! that evicts oldest-first; under sustained output it sheds history in
//! bursts to keep the bookkeeping trivial and the memory bound hard.

/// A byte-bounded sequence of output text fragments.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: Vec<String>,
    total_bytes: usize,
    limit: usize,
}

impl OutputBuffer {
    /// Create a buffer with the given byte ceiling.
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: Vec::new(),
            total_bytes: 0,
            limit,
        }
    }

    /// Append a fragment, resetting the buffer first if the ceiling would
    /// be crossed. A fragment larger than the ceiling still lands alone in
    /// the buffer; the next append will flush it.
    pub fn append(&mut self, text: &str) {
        if self.total_bytes + text.len() > self.limit {
            self.chunks.clear();
            self.total_bytes = 0;
        }
        self.total_bytes += text.len();
        self.chunks.push(text.to_string());
    }

    /// Drop everything, releasing the backing allocations. Used during
    /// cleanup to return memory promptly.
    pub fn clear(&mut self) {
        self.chunks = Vec::new();
        self.total_bytes = 0;
    }

    /// Bytes currently buffered.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of fragments currently buffered.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Buffered fragments in arrival order.
    pub fn snapshot(&self) -> &[String] {
        &self.chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_order_under_ceiling() {
        let mut buf = OutputBuffer::new(32);
        buf.append("one");
        buf.append("two");
        buf.append("three");
        assert_eq!(buf.snapshot(), ["one", "two", "three"]);
        assert_eq!(buf.total_bytes(), 11);
    }

    #[test]
    fn overflow_keeps_only_newest_fragment() {
        let mut buf = OutputBuffer::new(10);
        buf.append("aaaa");
        buf.append("bbbb");
        // 8 + 4 > 10: prior history is dropped in bulk.
        buf.append("cccc");
        assert_eq!(buf.snapshot(), ["cccc"]);
        assert_eq!(buf.total_bytes(), 4);
    }

    #[test]
    fn exact_fit_does_not_reset() {
        let mut buf = OutputBuffer::new(8);
        buf.append("aaaa");
        buf.append("bbbb");
        assert_eq!(buf.snapshot(), ["aaaa", "bbbb"]);
        assert_eq!(buf.total_bytes(), 8);
    }

    #[test]
    fn fragment_larger_than_ceiling_lands_alone() {
        let mut buf = OutputBuffer::new(4);
        buf.append("ab");
        buf.append("abcdefgh");
        assert_eq!(buf.snapshot(), ["abcdefgh"]);
        assert_eq!(buf.total_bytes(), 8);
        // The oversized fragment is flushed by the next append.
        buf.append("x");
        assert_eq!(buf.snapshot(), ["x"]);
        assert_eq!(buf.total_bytes(), 1);
    }

    #[test]
    fn clear_empties_everything() {
        let mut buf = OutputBuffer::new(64);
        buf.append("data");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.total_bytes(), 0);
        assert_eq!(buf.chunk_count(), 0);
    }
}
