#![forbid(unsafe_code)]

/// Growable FIFO byte buffer backed by one contiguous allocation.
///
/// Bytes are appended at the tail and consumed from the head. The
/// consumed prefix is reclaimed by compaction before the backing
/// storage grows, so steady-state traffic that is drained as fast as
/// it arrives never reallocates.
#[derive(Debug)]
pub(crate) struct ByteQueue {
    buf: Vec<u8>,
    offset: usize,
    len: usize,
}

impl ByteQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            offset: 0,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unconsumed bytes, oldest first.
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }

    /// Appends `data` at the tail, compacting or growing as needed.
    pub(crate) fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let tail_room = self.buf.len() - self.offset - self.len;
        if data.len() > tail_room {
            if self.len + data.len() <= self.buf.len() {
                // Compaction alone makes room.
                self.buf.copy_within(self.offset..self.offset + self.len, 0);
                self.offset = 0;
            } else {
                let mut capacity = self.buf.len().max(1);
                while capacity < self.len + data.len() {
                    capacity *= 2;
                }
                let mut grown = vec![0; capacity];
                grown[..self.len].copy_from_slice(self.as_slice());
                self.buf = grown;
                self.offset = 0;
            }
        }
        let tail = self.offset + self.len;
        self.buf[tail..tail + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    /// Moves up to `max` bytes from the head into `out`, returning
    /// how many were moved.
    pub(crate) fn drain_into(&mut self, out: &mut [u8], max: usize) -> usize {
        let n = max.min(out.len()).min(self.len);
        out[..n].copy_from_slice(&self.buf[self.offset..self.offset + n]);
        self.consume(n);
        n
    }

    /// Removes and returns the first `n` bytes. `n` must not exceed
    /// [`ByteQueue::len`].
    pub(crate) fn take(&mut self, n: usize) -> Vec<u8> {
        debug_assert!(n <= self.len);
        let out = self.buf[self.offset..self.offset + n].to_vec();
        self.consume(n);
        out
    }

    fn consume(&mut self, n: usize) {
        self.offset += n;
        self.len -= n;
        if self.len == 0 {
            self.offset = 0;
        }
    }
}
