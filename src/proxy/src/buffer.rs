//! Ordered sequence of byte segments with O(1) append and cheap prefix-consume.
//!
//! Segments are reference-counted so that a shallow clone shares storage with
//! the original; consuming bytes from the front never reallocates and never
//! mutates a segment shared with another clone, it only advances an offset or
//! drops whole segments from the front.

use std::collections::VecDeque;
use std::sync::Arc;

/// Minimum allocation granularity for a freshly appended flat buffer.
pub const SEGMENT_MIN_LEN: usize = 16 * 1024;

#[derive(Debug)]
struct Segment {
    data: Arc<Vec<u8>>,
    start: usize,
    end: usize,
}

impl Segment {
    fn len(&self) -> usize {
        self.end - self.start
    }

    fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn split_at(&self, at: usize) -> (Segment, Segment) {
        assert!(at <= self.len());
        (
            Segment {
                data: Arc::clone(&self.data),
                start: self.start,
                end: self.start + at,
            },
            Segment {
                data: Arc::clone(&self.data),
                start: self.start + at,
                end: self.end,
            },
        )
    }
}

impl Clone for Segment {
    fn clone(&self) -> Self {
        Segment {
            data: Arc::clone(&self.data),
            start: self.start,
            end: self.end,
        }
    }
}

/// Error raised by [`BufferChain::copy_out`] when the requested range runs
/// past the end of the chain.
#[derive(Debug, thiserror::Error)]
#[error("short read: requested {requested} bytes at offset {offset}, chain holds {available}")]
pub struct Short {
    pub offset: usize,
    pub requested: usize,
    pub available: usize,
}

/// An ordered, reference-counted sequence of byte segments.
#[derive(Debug, Clone, Default)]
pub struct BufferChain {
    segments: VecDeque<Segment>,
    length: usize,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let mut chain = Self::new();
        chain.push(data);
        chain
    }

    /// Appends a freshly-owned flat buffer as one segment, splitting it into
    /// `SEGMENT_MIN_LEN`-sized pieces if it is larger than that.
    pub fn push(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.length += data.len();
        let shared = Arc::new(data);
        let total = shared.len();
        let mut start = 0;
        while start < total {
            let end = std::cmp::min(start + SEGMENT_MIN_LEN, total);
            self.segments.push_back(Segment {
                data: Arc::clone(&shared),
                start,
                end,
            });
            start = end;
        }
    }

    /// Concatenates two chains in O(1); `other`'s segments are moved onto the
    /// end of `self`, segment storage is shared, not copied.
    pub fn append(&mut self, mut other: BufferChain) {
        self.length += other.length;
        self.segments.append(&mut other.segments);
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Drops exactly `min(n, length)` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let mut remaining = std::cmp::min(n, self.length);
        self.length -= remaining;
        while remaining > 0 {
            let front_len = match self.segments.front() {
                Some(s) => s.len(),
                None => break,
            };
            if front_len <= remaining {
                self.segments.pop_front();
                remaining -= front_len;
            } else {
                let front = self.segments.front_mut().unwrap();
                front.start += remaining;
                remaining = 0;
            }
        }
    }

    /// Copies `n` bytes starting at `offset` into `dst`, failing with
    /// [`Short`] if the chain does not hold that many bytes.
    pub fn copy_out(&self, offset: usize, n: usize, dst: &mut Vec<u8>) -> Result<(), Short> {
        if offset + n > self.length {
            return Err(Short {
                offset,
                requested: n,
                available: self.length,
            });
        }
        let mut skip = offset;
        let mut remaining = n;
        for seg in &self.segments {
            if remaining == 0 {
                break;
            }
            let seg_len = seg.len();
            if skip >= seg_len {
                skip -= seg_len;
                continue;
            }
            let take = std::cmp::min(seg_len - skip, remaining);
            dst.extend_from_slice(&seg.as_slice()[skip..skip + take]);
            remaining -= take;
            skip = 0;
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        self.copy_out(0, self.length, &mut out).expect("length is exact");
        out
    }

    /// An independent handle sharing the same segment storage; consuming on
    /// the clone never mutates `self`.
    pub fn shallow_clone(&self) -> BufferChain {
        self.clone()
    }

    /// Splits the chain at `n`: `head.length() == n`, `tail` is the remainder.
    pub fn split(mut self, n: usize) -> (BufferChain, BufferChain) {
        let n = std::cmp::min(n, self.length);
        let mut head = BufferChain::new();
        let mut remaining = n;
        while remaining > 0 {
            let front = match self.segments.pop_front() {
                Some(s) => s,
                None => break,
            };
            if front.len() <= remaining {
                remaining -= front.len();
                head.length += front.len();
                head.segments.push_back(front);
            } else {
                let (lhs, rhs) = front.split_at(remaining);
                head.length += lhs.len();
                head.segments.push_back(lhs);
                self.segments.push_front(rhs);
                remaining = 0;
            }
        }
        self.length -= head.length;
        (head, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_is_order_preserving_and_o1_in_segment_count() {
        let mut a = BufferChain::from_vec(b"hello ".to_vec());
        let b = BufferChain::from_vec(b"world".to_vec());
        a.append(b);
        assert_eq!(a.to_vec(), b"hello world");
        assert_eq!(a.length(), 11);
    }

    #[test]
    fn consume_never_mutates_a_shallow_clone() {
        let mut original = BufferChain::from_vec(b"abcdef".to_vec());
        let clone = original.shallow_clone();
        original.consume(3);
        assert_eq!(original.to_vec(), b"def");
        assert_eq!(clone.to_vec(), b"abcdef");
    }

    #[test]
    fn copy_out_reports_short_read() {
        let chain = BufferChain::from_vec(b"abc".to_vec());
        let mut out = Vec::new();
        assert!(chain.copy_out(0, 10, &mut out).is_err());
        assert!(chain.copy_out(0, 3, &mut out).is_ok());
        assert_eq!(out, b"abc");
    }

    #[test]
    fn split_head_and_tail_partition_the_chain() {
        let chain = BufferChain::from_vec(b"0123456789".to_vec());
        let (head, tail) = chain.split(4);
        assert_eq!(head.length(), 4);
        assert_eq!(head.to_vec(), b"0123");
        assert_eq!(tail.to_vec(), b"456789");
    }

    #[test]
    fn segments_larger_than_minimum_span_multiple_segments() {
        let big = vec![7u8; SEGMENT_MIN_LEN * 3 + 17];
        let chain = BufferChain::from_vec(big.clone());
        assert_eq!(chain.length(), big.len());
        assert_eq!(chain.to_vec(), big);
    }
}
