//! An append-only sequence of buffers.
//!
//! Appending is O(1) and never touches earlier buffers. [Rope::flatten] and
//! [Rope::slice] copy the content out into one contiguous [Buffer].

#[cfg(feature = "logging")]
use crate::log::trace;
use crate::{buffer::Buffer, error::Result};

/// String buffer with O(1) append and O(n) other operations.
///
/// Not technically a rope but in the same spirit.
#[derive(Debug, Default, Clone)]
pub struct Rope {
    buffers: Vec<Buffer>,

    /// Always the sum of the lengths of `buffers`.
    length: usize,
}

/// How the extent `[a, b)` of one buffer relates to a requested range `[start, end)`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Overlap {
    /// The buffer ends at or before `start`.
    Before,

    /// The buffer starts at or after `end`.
    After,

    /// The buffer lies entirely within the range.
    Inside,

    /// The range lies strictly within the buffer.
    Covers,

    /// The buffer straddles `start` and ends within the range.
    Head,

    /// The buffer starts within the range and straddles `end`.
    Tail,
}

impl Overlap {
    const fn classify(a: usize, b: usize, start: usize, end: usize) -> Self {
        if b <= start && a < start {
            Self::Before
        } else if a >= end && a > start {
            Self::After
        } else if a >= start && b <= end {
            Self::Inside
        } else if a < start && b > end {
            Self::Covers
        } else if a < start {
            Self::Head
        } else {
            Self::Tail
        }
    }
}

impl Rope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffers.push(Buffer::from_slice(bytes)?);
        self.length += bytes.len();
        Ok(())
    }

    /// Appends a copy of `buffer`.
    pub fn append_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        self.buffers.push(buffer.copy()?);
        self.length += buffer.len();
        Ok(())
    }

    /// Appends `buffer` without copying it.
    pub(crate) fn push_buffer(&mut self, buffer: Buffer) {
        self.length += buffer.len();
        self.buffers.push(buffer);
    }

    pub(crate) fn append_byte(&mut self, byte: u8) -> Result<()> {
        self.append_bytes(&[byte])
    }

    pub(crate) fn append_u16(&mut self, value: u16) -> Result<()> {
        self.append_bytes(&value.to_be_bytes())
    }

    pub(crate) fn append_u32(&mut self, value: u32) -> Result<()> {
        self.append_bytes(&value.to_be_bytes())
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns all appended content, in append order, as one buffer.
    pub fn flatten(&self) -> Result<Buffer> {
        let mut flat = Buffer::empty(self.length)?;
        let out = flat.data_mut();
        let mut counter = 0;
        for buf in self.buffers.iter() {
            out[counter..counter + buf.len()].copy_from_slice(buf.data());
            counter += buf.len();
        }
        Ok(flat)
    }

    /// Returns the bytes in `[start, end)` of the logical concatenation.
    ///
    /// Negative bounds count from the end. The pair is swapped if
    /// `start > end`. A bound beyond the content is clamped to the last valid
    /// index instead of producing an empty result.
    pub fn slice(&self, start: isize, end: isize) -> Result<Buffer> {
        let (start, end) = self.resolve_range(start, end);
        trace!("rope slice [{}, {}) of {} bytes", start, end, self.length);

        let mut out = Vec::with_capacity(end - start);
        let mut offset = 0;
        for buf in self.buffers.iter() {
            let a = offset;
            let b = offset + buf.len();
            let data = buf.data();
            match Overlap::classify(a, b, start, end) {
                Overlap::Before => {}
                Overlap::After => break,
                Overlap::Inside => out.extend_from_slice(data),
                Overlap::Covers => out.extend_from_slice(&data[start - a..end - a]),
                Overlap::Head => out.extend_from_slice(&data[start - a..]),
                Overlap::Tail => out.extend_from_slice(&data[..end - a]),
            }
            offset = b;
        }

        Buffer::from_slice(&out)
    }

    fn resolve_range(&self, start: isize, end: isize) -> (usize, usize) {
        if self.length == 0 {
            return (0, 0);
        }
        let length = self.length as isize;
        let resolve = |i: isize| if i < 0 { i + length } else { i };

        let (mut start, mut end) = (resolve(start), resolve(end));
        if start > end {
            std::mem::swap(&mut start, &mut end);
        }

        let clamp = |i: isize| {
            if i < 0 {
                0
            } else if i > length {
                length - 1
            } else {
                i
            }
        };
        let (start, end) = (clamp(start), clamp(end));
        if start > end {
            (end as usize, start as usize)
        } else {
            (start as usize, end as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Overlap, Rope};
    use test_log::test;

    fn rope_of(parts: &[&[u8]]) -> Rope {
        let mut rope = Rope::new();
        for part in parts {
            rope.append_bytes(part).unwrap();
        }
        rope
    }

    #[test]
    fn test_flatten_concatenates_in_order() {
        let rope = rope_of(&[b"ab", b"", b"cde", b"f"]);
        assert_eq!(rope.len(), 6);
        let flat = rope.flatten().unwrap();
        assert_eq!(flat.data(), b"abcdef");
        assert_eq!(flat.len(), rope.len());
    }

    #[test]
    fn test_overlap_classify() {
        // requested range is [4, 8)
        assert_eq!(Overlap::classify(0, 4, 4, 8), Overlap::Before);
        assert_eq!(Overlap::classify(8, 10, 4, 8), Overlap::After);
        assert_eq!(Overlap::classify(4, 8, 4, 8), Overlap::Inside);
        assert_eq!(Overlap::classify(5, 7, 4, 8), Overlap::Inside);
        assert_eq!(Overlap::classify(2, 10, 4, 8), Overlap::Covers);
        assert_eq!(Overlap::classify(2, 6, 4, 8), Overlap::Head);
        assert_eq!(Overlap::classify(2, 8, 4, 8), Overlap::Head);
        assert_eq!(Overlap::classify(6, 10, 4, 8), Overlap::Tail);
        assert_eq!(Overlap::classify(4, 10, 4, 8), Overlap::Tail);
    }

    #[test]
    fn test_slice_across_buffers() {
        let rope = rope_of(&[b"abc", b"def", b"ghi"]);
        assert_eq!(rope.slice(0, 2).unwrap().data(), b"ab");
        assert_eq!(rope.slice(2, 7).unwrap().data(), b"cdefg");
        assert_eq!(rope.slice(3, 6).unwrap().data(), b"def");
        assert_eq!(rope.slice(4, 5).unwrap().data(), b"e");
        assert_eq!(rope.slice(0, 9).unwrap().data(), b"abcdefghi");
        assert_eq!(rope.slice(5, 5).unwrap().data(), b"");
    }

    #[test]
    fn test_slice_negative_and_swapped() {
        let rope = rope_of(&[b"abc", b"def"]);
        assert_eq!(rope.slice(-2, 6).unwrap().data(), b"ef");
        assert_eq!(rope.slice(-4, -1).unwrap().data(), b"cde");
        assert_eq!(rope.slice(4, 1).unwrap().data(), b"bcd");
    }

    #[test]
    fn test_slice_clamps_out_of_range() {
        let rope = rope_of(&[b"abc", b"def"]);
        // end past the content clamps to the last index, not to the length.
        assert_eq!(rope.slice(0, 100).unwrap().data(), b"abcde");
        assert_eq!(rope.slice(-100, 2).unwrap().data(), b"ab");

        let empty = Rope::new();
        assert!(empty.slice(0, 2).unwrap().is_empty());
    }

    #[test]
    fn test_slice_matches_flatten_randomized() {
        for _ in 0..200 {
            let mut rope = Rope::new();
            let mut expected = Vec::new();
            for _ in 0..fastrand::usize(1..8) {
                let part: Vec<u8> = (0..fastrand::usize(0..6)).map(|_| fastrand::u8(..)).collect();
                expected.extend_from_slice(&part);
                rope.append_bytes(&part).unwrap();
            }
            let flat = rope.flatten().unwrap();
            assert_eq!(flat.data(), &expected[..]);

            let len = expected.len();
            let start = fastrand::usize(0..=len);
            let end = fastrand::usize(start..=len);
            let slice = rope.slice(start as isize, end as isize).unwrap();
            assert_eq!(slice.data(), &expected[start..end]);
        }
    }
}
