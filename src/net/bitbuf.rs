//! Bit-level packet cursor
//!
//! `BitWriter` is the single cursor threaded by exclusive borrow through
//! update encoding. Every write is bounds-checked against the packet limit
//! and reports how many bits it produced. `BitReader` is its mirror.
//!
//! Bits are LSB-first within each byte.

use bitvec::prelude::*;

use crate::constants::wire::MAX_VARINT_GROUPS;

/// Errors that can occur while writing or reading bits
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitBufError {
    #[error("write of {requested} bits exceeds the {limit} bit limit")]
    Overflow { limit: usize, requested: usize },
    #[error("read of {requested} bits at bit {position} runs past the end")]
    UnexpectedEnd { position: usize, requested: usize },
    #[error("value {value} does not fit in {bits} bits")]
    ValueTooWide { value: u64, bits: usize },
    #[error("varint longer than {0} groups")]
    VarintTooLong(usize),
}

/// Number of bits produced by a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BitCount(pub usize);

impl std::ops::Add for BitCount {
    type Output = BitCount;

    fn add(self, rhs: BitCount) -> BitCount {
        BitCount(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for BitCount {
    fn add_assign(&mut self, rhs: BitCount) {
        self.0 += rhs.0;
    }
}

/// Bounded bit writer
#[derive(Debug, Clone)]
pub struct BitWriter {
    bits: BitVec<u8, Lsb0>,
    max_bits: usize,
}

impl BitWriter {
    /// Writer that refuses to grow past `max_bytes`
    pub fn with_byte_limit(max_bytes: usize) -> Self {
        Self {
            bits: BitVec::with_capacity((max_bytes * 8).min(1 << 16)),
            max_bits: max_bytes.saturating_mul(8),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            bits: BitVec::new(),
            max_bits: usize::MAX,
        }
    }

    #[inline]
    pub fn len_bits(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline]
    pub fn limit_bits(&self) -> usize {
        self.max_bits
    }

    #[inline]
    fn reserve(&self, n: usize) -> Result<(), BitBufError> {
        if self.bits.len().saturating_add(n) > self.max_bits {
            return Err(BitBufError::Overflow {
                limit: self.max_bits,
                requested: self.bits.len() + n,
            });
        }
        Ok(())
    }

    pub fn write_bit(&mut self, bit: bool) -> Result<BitCount, BitBufError> {
        self.reserve(1)?;
        self.bits.push(bit);
        Ok(BitCount(1))
    }

    /// Write the low `n` bits of `value` (`n <= 64`)
    pub fn write_bits(&mut self, value: u64, n: usize) -> Result<BitCount, BitBufError> {
        if n == 0 {
            return Ok(BitCount(0));
        }
        if n > 64 || (n < 64 && value >> n != 0) {
            return Err(BitBufError::ValueTooWide { value, bits: n });
        }
        self.reserve(n)?;

        let start = self.bits.len();
        self.bits.resize(start + n, false);
        self.bits[start..].store_le::<u64>(value);
        Ok(BitCount(n))
    }

    /// LEB128 over bits: 7 value bits plus a continuation bit per group
    pub fn write_varint(&mut self, mut value: u64) -> Result<BitCount, BitBufError> {
        let start = self.bits.len();
        loop {
            let group = value & 0x7f;
            value >>= 7;
            let more = value != 0;
            let byte = group | if more { 0x80 } else { 0 };
            if let Err(e) = self.write_bits(byte, 8) {
                self.bits.truncate(start);
                return Err(e);
            }
            if !more {
                break;
            }
        }
        Ok(BitCount(self.bits.len() - start))
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<BitCount, BitBufError> {
        self.write_bitslice(bytes.view_bits::<Lsb0>())
    }

    /// Splice previously encoded bits in verbatim
    pub fn write_bitslice(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<BitCount, BitBufError> {
        self.reserve(bits.len())?;
        self.bits.extend_from_bitslice(bits);
        Ok(BitCount(bits.len()))
    }

    pub fn as_bitslice(&self) -> &BitSlice<u8, Lsb0> {
        &self.bits
    }

    /// Bits written since `start`
    pub fn bits_since(&self, start: usize) -> &BitSlice<u8, Lsb0> {
        &self.bits[start..]
    }

    pub fn into_bitvec(self) -> BitVec<u8, Lsb0> {
        self.bits
    }

    /// Finish into whole bytes; padding bits are zero
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bits = self.bits;
        bits.set_uninitialized(false);
        bits.into_vec()
    }
}

/// Bit reader over a finished packet
pub struct BitReader<'a> {
    bits: &'a BitSlice<u8, Lsb0>,
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(bits: &'a BitSlice<u8, Lsb0>) -> Self {
        Self { bits, position: 0 }
    }

    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Self::new(bytes.view_bits::<Lsb0>())
    }

    #[inline]
    fn take(&mut self, n: usize) -> Result<&'a BitSlice<u8, Lsb0>, BitBufError> {
        if self.position + n > self.bits.len() {
            return Err(BitBufError::UnexpectedEnd {
                position: self.position,
                requested: n,
            });
        }
        let slice = &self.bits[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    pub fn read_bit(&mut self) -> Result<bool, BitBufError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bits(&mut self, n: usize) -> Result<u64, BitBufError> {
        if n == 0 {
            return Ok(0);
        }
        if n > 64 {
            return Err(BitBufError::ValueTooWide { value: 0, bits: n });
        }
        Ok(self.take(n)?.load_le::<u64>())
    }

    pub fn read_varint(&mut self) -> Result<u64, BitBufError> {
        let mut value = 0u64;
        for group in 0..MAX_VARINT_GROUPS {
            let byte = self.read_bits(8)?;
            value |= (byte & 0x7f) << (7 * group);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(BitBufError::VarintTooLong(MAX_VARINT_GROUPS))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, BitBufError> {
        let bits = self.take(len * 8)?;
        Ok(bits.chunks(8).map(|chunk| chunk.load_le::<u8>()).collect())
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bits.len() - self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_mixed() {
        let mut writer = BitWriter::unbounded();
        writer.write_bit(true).unwrap();
        writer.write_bits(0b101, 3).unwrap();
        writer.write_bits(123_456, 17).unwrap();
        writer.write_varint(300).unwrap();
        writer.write_bytes(b"abc").unwrap();
        writer.write_bit(false).unwrap();

        let bytes = writer.into_bytes();
        let mut reader = BitReader::from_bytes(&bytes);

        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bits(17).unwrap(), 123_456);
        assert_eq!(reader.read_varint().unwrap(), 300);
        assert_eq!(reader.read_bytes(3).unwrap(), b"abc".to_vec());
        assert!(!reader.read_bit().unwrap());
    }

    #[test]
    fn test_varint_sizes() {
        let mut writer = BitWriter::unbounded();
        assert_eq!(writer.write_varint(0).unwrap(), BitCount(8));
        assert_eq!(writer.write_varint(127).unwrap(), BitCount(8));
        assert_eq!(writer.write_varint(128).unwrap(), BitCount(16));
        assert_eq!(writer.write_varint(u64::MAX).unwrap(), BitCount(80));

        let bits = writer.into_bitvec();
        let mut reader = BitReader::new(&bits);
        assert_eq!(reader.read_varint().unwrap(), 0);
        assert_eq!(reader.read_varint().unwrap(), 127);
        assert_eq!(reader.read_varint().unwrap(), 128);
        assert_eq!(reader.read_varint().unwrap(), u64::MAX);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_writer_enforces_limit() {
        let mut writer = BitWriter::with_byte_limit(1);
        writer.write_bits(0x7f, 7).unwrap();
        assert!(writer.write_bit(true).is_ok());
        assert!(matches!(writer.write_bit(true), Err(BitBufError::Overflow { limit: 8, .. })));
        assert_eq!(writer.len_bits(), 8);
    }

    #[test]
    fn test_failed_varint_leaves_no_partial_bits() {
        let mut writer = BitWriter::with_byte_limit(1);
        writer.write_bit(true).unwrap();
        assert!(writer.write_varint(1 << 20).is_err());
        assert_eq!(writer.len_bits(), 1);
    }

    #[test]
    fn test_value_too_wide() {
        let mut writer = BitWriter::unbounded();
        assert!(matches!(
            writer.write_bits(8, 3),
            Err(BitBufError::ValueTooWide { value: 8, bits: 3 })
        ));
        assert!(writer.write_bits(u64::MAX, 64).is_ok());
    }

    #[test]
    fn test_splice_bitslice() {
        let mut cached = BitWriter::unbounded();
        cached.write_bits(0b1_0110, 5).unwrap();
        let cached = cached.into_bitvec();

        let mut writer = BitWriter::unbounded();
        writer.write_bit(true).unwrap();
        assert_eq!(writer.write_bitslice(&cached).unwrap(), BitCount(5));
        assert_eq!(writer.bits_since(1), &cached[..]);

        let bits = writer.into_bitvec();
        let mut reader = BitReader::new(&bits);
        reader.read_bit().unwrap();
        assert_eq!(reader.read_bits(5).unwrap(), 0b1_0110);
    }

    #[test]
    fn test_reader_overflow() {
        let data = vec![0xffu8];
        let mut reader = BitReader::from_bytes(&data);
        assert!(reader.read_bits(8).is_ok());
        assert!(matches!(reader.read_bit(), Err(BitBufError::UnexpectedEnd { position: 8, .. })));
    }

    #[test]
    fn test_unterminated_varint() {
        let data = vec![0xffu8; 12];
        let mut reader = BitReader::from_bytes(&data);
        assert_eq!(reader.read_varint(), Err(BitBufError::VarintTooLong(MAX_VARINT_GROUPS)));
    }
}
