//! Dynamic byte buffer (spec component A).
//!
//! Stands in for the `sds` calls the original core leans on directly
//! (`sdsMakeRoomFor`, `sdsrange`, `sdsIncrLen`, `sdslen`): growable, cheap
//! length queries, and an explicit "shift consumed bytes out" operation so
//! the parser's `qb_pos` trimming (spec section 4.G, "Post-parse trim")
//! has something concrete to call.

#[derive(Debug, Default)]
pub struct DynBuf {
    data: Vec<u8>,
}

impl DynBuf {
    pub fn new() -> Self {
        DynBuf { data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Ensure at least `additional` more bytes can be appended without a
    /// further reallocation. Mirrors `sdsMakeRoomFor`.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Grow the buffer's logical length by `n` uninitialized bytes and
    /// return a mutable slice over the newly exposed region, so a `read(2)`
    /// can write directly into it without an intermediate copy. Mirrors
    /// `sdsIncrLen` paired with the read call in `readQueryFromClient`.
    pub fn spare_capacity_mut(&mut self, n: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        &mut self.data[start..]
    }

    /// Shrink the logical length back down after a short read reported
    /// fewer bytes than `spare_capacity_mut` exposed.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Discard the first `n` bytes, shifting the remainder to offset 0.
    /// This is the "post-parse trim" / big-argument compaction primitive
    /// (spec section 4.G steps 2b and "Post-parse trim").
    pub fn drain_prefix(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.data.drain(0..n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Replace the buffer's storage outright, used by the zero-copy big
    /// argument path (spec section 4.G step 2d) to install a freshly
    /// allocated, empty `querybuf` after stealing the old one.
    pub fn replace(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Take ownership of the backing storage, leaving this buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_drain_prefix() {
        let mut buf = DynBuf::new();
        buf.extend_from_slice(b"hello world");
        assert_eq!(buf.len(), 11);
        buf.drain_prefix(6);
        assert_eq!(buf.as_slice(), b"world");
    }

    #[test]
    fn spare_capacity_mut_then_truncate_on_short_read() {
        let mut buf = DynBuf::new();
        buf.extend_from_slice(b"ab");
        {
            let spare = buf.spare_capacity_mut(10);
            spare[0] = b'x';
        }
        assert_eq!(buf.len(), 12);
        buf.truncate(3); // pretend only 1 byte was actually read
        assert_eq!(buf.as_slice(), b"abx");
    }

    #[test]
    fn replace_and_take_swap_storage() {
        let mut buf = DynBuf::new();
        buf.extend_from_slice(b"big-argument-payload");
        let stolen = buf.take();
        assert_eq!(stolen, b"big-argument-payload");
        assert!(buf.is_empty());
        buf.replace(Vec::with_capacity(64));
        assert!(buf.is_empty());
    }
}
