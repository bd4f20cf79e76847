//! Byte buffer used for connection input and output.
//!
//! Non-blocking reads and writes rarely transfer a whole application-level
//! message at once, so both directions of a connection need a place to park
//! partial data. The buffer keeps three contiguous regions inside one
//! `Vec<u8>`:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index    <=    len
//! ```
//!
//! The first [`CHEAP_PREPEND`] bytes are reserved so a length prefix can be
//! written in front of already-buffered data without shifting it. Reads
//! advance `reader_index`, writes advance `writer_index`, and space freed by
//! reads is reclaimed by sliding the readable region back to the prepend
//! boundary before the backing storage is ever grown.

use std::io::{IoSlice, IoSliceMut, Read, Write};

/// Reserved space in front of the readable region, sized for a length prefix.
pub const CHEAP_PREPEND: usize = 8;

/// Initial size of the data area (excluding the prepend area).
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack-resident spill segment used by [`Buffer::read_from`].
const EXTRA_BUF_SIZE: usize = 64 * 1024;

/// Growable byte buffer with a reserved prepend area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates a buffer with the default data-area capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer whose data area can hold `initial` bytes before the
    /// first reallocation.
    pub fn with_capacity(initial: usize) -> Self {
        Self {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without reallocating or sliding.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Space in front of the readable region (reserved head plus bytes
    /// already consumed).
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes `len` bytes. Consuming everything resets both cursors to the
    /// prepend boundary so the whole data area becomes writable again.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes the whole readable region.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consumes `len` bytes and returns them as a (lossily decoded) string.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let s = String::from_utf8_lossy(&self.buf[self.reader_index..self.reader_index + len])
            .into_owned();
        self.retrieve(len);
        s
    }

    /// Consumes the whole readable region as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Consumes the whole readable region as raw bytes.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    /// Makes room for at least `len` writable bytes.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Appends `data` after the readable region.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` immediately in front of the readable region.
    ///
    /// Used for length-prefix framing: fill the body first, then prepend the
    /// header. Panics if `data` is larger than the prependable space.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend of {} bytes exceeds the {} prependable bytes",
            data.len(),
            self.prependable_bytes()
        );
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Enough slack overall: slide the readable region back to the
            // prepend boundary instead of growing.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Fills the buffer from `reader` with a single vectored read.
    ///
    /// The read targets the writable tail plus a 64 KiB stack segment, so
    /// one syscall per readiness event suffices no matter how much data the
    /// kernel has queued, without pre-growing the heap buffer. Overflow into
    /// the stack segment is appended afterwards.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> std::io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let (_, tail) = self.buf.split_at_mut(self.writer_index);
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            reader.read_vectored(&mut iov)?
        };
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `writer` with a single write call.
    ///
    /// Does not consume; the caller retrieves whatever was accepted.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> std::io::Result<usize> {
        writer.write_vectored(&[IoSlice::new(self.peek())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn check_invariants(buf: &Buffer) {
        assert!(CHEAP_PREPEND <= buf.reader_index);
        assert!(buf.reader_index <= buf.writer_index);
        assert!(buf.writer_index <= buf.buf.len());
    }

    #[test]
    fn starts_empty_with_prepend_reserved() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        check_invariants(&buf);
    }

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        check_invariants(&buf);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");
        assert_eq!(buf.retrieve_all_as_string(), "hello world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        check_invariants(&buf);
    }

    #[test]
    fn partial_retrieve_advances_reader() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"cdef");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 2);
        assert_eq!(buf.retrieve_as_string(3), "cde");
        assert_eq!(buf.retrieve_all_as_bytes(), b"f");
        check_invariants(&buf);
    }

    #[test]
    fn retrieving_everything_resets_cursors() {
        let mut buf = Buffer::new();
        buf.append(b"xyz");
        buf.retrieve(3);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn make_space_slides_before_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; INITIAL_SIZE]);
        buf.retrieve(800);
        let cap_before = buf.buf.len();

        // 224 readable; 800 reclaimable in front; no growth needed.
        buf.append(&vec![b'b'; 700]);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE - 800 + 700);

        let expected: Vec<u8> = std::iter::repeat(b'a')
            .take(INITIAL_SIZE - 800)
            .chain(std::iter::repeat(b'b').take(700))
            .collect();
        assert_eq!(buf.peek(), &expected[..]);
        check_invariants(&buf);
    }

    #[test]
    fn make_space_grows_and_preserves_content() {
        let mut buf = Buffer::new();
        buf.append(b"keep");
        buf.append(&vec![b'z'; INITIAL_SIZE * 2]);
        assert!(buf.writable_bytes() < INITIAL_SIZE * 2 || buf.buf.len() > INITIAL_SIZE);
        assert_eq!(&buf.peek()[..4], b"keep");
        assert_eq!(buf.readable_bytes(), 4 + INITIAL_SIZE * 2);
        check_invariants(&buf);
    }

    #[test]
    fn ensure_writable_provides_requested_space() {
        let mut buf = Buffer::new();
        buf.append(b"data");
        buf.ensure_writable_bytes(INITIAL_SIZE * 4);
        assert!(buf.writable_bytes() >= INITIAL_SIZE * 4);
        assert_eq!(buf.peek(), b"data");
    }

    #[test]
    fn prepend_writes_in_front() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let len = (buf.readable_bytes() as u32).to_be_bytes();
        buf.prepend(&len);
        assert_eq!(buf.readable_bytes(), 4 + 7);
        assert_eq!(&buf.peek()[..4], &7u32.to_be_bytes());
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    #[should_panic]
    fn prepend_larger_than_head_panics() {
        let mut buf = Buffer::new();
        buf.prepend(&[0u8; CHEAP_PREPEND + 1]);
    }

    #[test]
    fn read_from_fits_in_writable_tail() {
        let mut buf = Buffer::new();
        let mut src = Cursor::new(vec![b'q'; 100]);
        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(n, 100);
        assert_eq!(buf.readable_bytes(), 100);
        check_invariants(&buf);
    }

    #[test]
    fn read_from_spills_into_extra_segment() {
        let mut buf = Buffer::new();
        let payload: Vec<u8> = (0..INITIAL_SIZE + 500).map(|i| (i % 251) as u8).collect();
        let mut src = Cursor::new(payload.clone());
        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);
        check_invariants(&buf);
    }

    #[test]
    fn write_to_does_not_consume() {
        let mut buf = Buffer::new();
        buf.append(b"outbound");
        let mut sink = Vec::new();
        let n = buf.write_to(&mut sink).unwrap();
        assert_eq!(n, 8);
        assert_eq!(sink, b"outbound");
        assert_eq!(buf.readable_bytes(), 8);
        buf.retrieve(n);
        assert_eq!(buf.readable_bytes(), 0);
    }
}
