use std::fmt;

use crate::error::{Error, Result};

/// Bit-per-piece possession vector.
///
/// Wire layout is big-endian with the high bit first; the final byte is
/// zero-padded. Receivers derive the piece count from their metainfo, so
/// serialization is length-implicit.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    len: usize,
}

fn byte_len(len: usize) -> usize {
    (len + 7) / 8
}

impl Bitfield {
    /// All-zero bitfield of `len` pieces.
    pub fn new(len: usize) -> Self {
        Self { bytes: vec![0u8; byte_len(len)], len }
    }

    /// All-one bitfield of `len` pieces.
    pub fn full(len: usize) -> Self {
        let mut bf = Self::new(len);
        for i in 0..len {
            bf.set(i);
        }
        bf
    }

    /// Decodes a wire bitfield for a torrent of `len` pieces.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        if bytes.len() != byte_len(len) {
            return Err(Error::Parse(format!(
                "bitfield has {} bytes, want {} for {} pieces",
                bytes.len(),
                byte_len(len),
                len,
            )));
        }
        Ok(Self { bytes: bytes.to_vec(), len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has(&self, i: usize) -> bool {
        if i >= self.len {
            return false;
        }
        self.bytes[i / 8] & (0x80 >> (i % 8)) != 0
    }

    /// Sets bit `i`. Returns whether the bit was newly set.
    pub fn set(&mut self, i: usize) -> bool {
        if i >= self.len {
            return false;
        }
        let mask = 0x80 >> (i % 8);
        let byte = &mut self.bytes[i / 8];
        let newly = *byte & mask == 0;
        *byte |= mask;
        newly
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn complete(&self) -> bool {
        self.count() == self.len
    }

    pub fn missing_indices(&self) -> Vec<usize> {
        (0..self.len).filter(|&i| !self.has(i)).collect()
    }

    /// Byte-wise AND of two same-length bitfields.
    pub fn intersect(&self, other: &Bitfield) -> Bitfield {
        debug_assert_eq!(self.len, other.len);
        let bytes = self
            .bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(a, b)| a & b)
            .collect();
        Bitfield { bytes, len: self.len.min(other.len) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitfield({}/{})", self.count(), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has() {
        let mut bf = Bitfield::new(10);
        assert!(!bf.has(3));
        assert!(bf.set(3));
        assert!(!bf.set(3));
        assert!(bf.has(3));
        assert!(!bf.has(4));
        assert_eq!(bf.count(), 1);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut bf = Bitfield::new(3);
        assert!(!bf.set(3));
        assert!(!bf.has(100));
        assert_eq!(bf.count(), 0);
    }

    #[test]
    fn test_wire_layout_high_bit_first() {
        let mut bf = Bitfield::new(10);
        bf.set(0);
        bf.set(9);
        assert_eq!(bf.as_bytes(), &[0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert!(Bitfield::from_bytes(&[0xff], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0x00], 10).is_ok());
        let bf = Bitfield::from_bytes(&[0b1010_0000], 4).unwrap();
        assert!(bf.has(0));
        assert!(!bf.has(1));
        assert!(bf.has(2));
        assert!(!bf.has(3));
    }

    #[test]
    fn test_complete_and_missing() {
        let mut bf = Bitfield::new(3);
        assert_eq!(bf.missing_indices(), vec![0, 1, 2]);
        bf.set(1);
        assert_eq!(bf.missing_indices(), vec![0, 2]);
        bf.set(0);
        bf.set(2);
        assert!(bf.complete());
        assert!(bf.missing_indices().is_empty());
        assert!(Bitfield::full(3).complete());
    }

    #[test]
    fn test_intersect() {
        let mut a = Bitfield::new(9);
        let mut b = Bitfield::new(9);
        a.set(0);
        a.set(5);
        a.set(8);
        b.set(5);
        b.set(8);
        b.set(2);
        let both = a.intersect(&b);
        assert!(!both.has(0));
        assert!(!both.has(2));
        assert!(both.has(5));
        assert!(both.has(8));
        assert_eq!(both.count(), 2);
    }

    #[test]
    fn test_empty_bitfield_is_complete() {
        assert!(Bitfield::new(0).complete());
    }
}
