use slice_deque::SliceDeque;

type ByteDeque = SliceDeque<u8>;

/// A buffered FIFO byte queue backed by a contiguous double-ended slice.
/// Data is appended at the tail and consumed from the head; the pipeline
/// stages move bytes between buffers with `transfer` and hand slices out
/// with `peek`/`read_slice` without copying.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    /// Creates a buffer with the given soft capacity. The capacity bounds
    /// `free_capacity`; explicit `append` calls may exceed it and are bounded
    /// by the caller's advertised credit instead.
    #[inline]
    pub fn new(size: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The soft capacity the buffer was created with.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Free space against the soft capacity; zero once the buffer holds
    /// `size` or more bytes.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size.saturating_sub(self.data.len())
    }

    /// Discards `count` bytes from the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Slice over all buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Discards all buffered data.
    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Appends the supplied bytes at the tail.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend(bytes.iter().cloned());
    }

    /// Removes and returns up to `max` bytes from the head.
    #[inline]
    pub fn pop(&mut self, max: usize) -> Vec<u8> {
        let count = max.min(self.data.len());
        let out = self.data[..count].to_vec();
        self.move_head(count);
        out
    }

    /// Removes all buffered bytes from the head.
    #[inline]
    pub fn pop_all(&mut self) -> Vec<u8> {
        self.pop(self.data.len())
    }

    /// Copies up to `max` bytes from the head without consuming them.
    #[inline]
    pub fn peek(&self, max: usize) -> &[u8] {
        let count = max.min(self.data.len());
        &self.data[..count]
    }

    /// Moves up to `max` bytes from the head of this buffer to the tail of
    /// `other`, returning the number of bytes moved.
    #[inline]
    pub fn transfer(&mut self, other: &mut Buffer, max: usize) -> usize {
        let count = max.min(self.data.len());
        other.append(&self.data[..count]);
        self.move_head(count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_across_mixed_chunks() {
        let mut buffer = Buffer::new(64);

        buffer.append(b"one");
        buffer.append(b" two");
        buffer.append(b" three");
        assert_eq!(buffer.len(), 13);

        // Pops in sizes unrelated to the appends still come out in order
        assert_eq!(buffer.pop(5), b"one t".to_vec());
        assert_eq!(buffer.pop(1), b"w".to_vec());
        assert_eq!(buffer.pop_all(), b"o three".to_vec());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pop_caps_at_buffered_data() {
        let mut buffer = Buffer::new(8);

        assert_eq!(buffer.pop(4), Vec::<u8>::new());

        buffer.append(b"xy");
        assert_eq!(buffer.pop(100), b"xy".to_vec());
        assert_eq!(buffer.pop_all(), Vec::<u8>::new());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buffer = Buffer::new(16);
        buffer.append(&[1, 2, 3, 4, 5]);

        assert_eq!(buffer.peek(3), &[1, 2, 3]);
        assert_eq!(buffer.peek(100), &[1, 2, 3, 4, 5]);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.read_slice(), &[1, 2, 3, 4, 5]);

        assert_eq!(buffer.pop_all(), vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.peek(1), &[] as &[u8]);
    }

    #[test]
    fn test_free_capacity_tracks_soft_limit() {
        let mut buffer = Buffer::new(8);
        assert_eq!(buffer.free_capacity(), 8);
        assert_eq!(buffer.size(), 8);

        buffer.append(&[0; 6]);
        assert_eq!(buffer.free_capacity(), 2);

        // The soft capacity does not reject appends; credit does that at the
        // consume sites, so an overfull buffer just reports no free space
        buffer.append(&[0; 6]);
        assert_eq!(buffer.len(), 12);
        assert_eq!(buffer.free_capacity(), 0);

        buffer.pop(9);
        assert_eq!(buffer.free_capacity(), 5);
    }

    #[test]
    fn test_transfer_preserves_order_and_counts() {
        let mut src = Buffer::new(16);
        let mut dst = Buffer::new(16);
        dst.append(b"head ");
        src.append(b"tail bytes");

        assert_eq!(src.transfer(&mut dst, 4), 4);
        assert_eq!(dst.read_slice(), b"head tail");
        assert_eq!(src.read_slice(), b" bytes");

        // Remainder moves even when max overshoots, nothing moves when empty
        assert_eq!(src.transfer(&mut dst, 100), 6);
        assert_eq!(dst.read_slice(), b"head tail bytes");
        assert_eq!(src.transfer(&mut dst, 100), 0);
        assert!(src.is_empty());
    }

    #[test]
    fn test_move_head_discards_consumed_prefix() {
        let mut buffer = Buffer::new(16);
        buffer.append(&[9, 8, 7, 6]);

        buffer.move_head(2);
        assert_eq!(buffer.read_slice(), &[7, 6]);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), 16);
    }

    #[test]
    fn test_interleaved_append_and_drain() {
        // Sliding-window usage: producer appends while consumer drains
        let mut buffer = Buffer::new(32);
        let mut drained = Vec::new();

        for round in 0..50u8 {
            buffer.append(&[round; 3]);
            drained.extend(buffer.pop(2));
        }
        drained.extend(buffer.pop_all());

        let expected: Vec<u8> = (0..50u8).flat_map(|round| [round; 3]).collect();
        assert_eq!(drained, expected);
    }
}
