//! Fixed-width value codecs.

use pd_error::Result;
use pd_types::{ParseError, ensure_slice, read_le_u64, write_le_u64};

/// A value stored in B-tree leaves.
///
/// Every value occupies exactly `DISK_SIZE` little-endian bytes. Equality is
/// the type's own notion of identity and decides whether overwriting a key
/// changes reference counts.
pub trait ValueType: Clone + PartialEq + std::fmt::Debug {
    const DISK_SIZE: usize;

    fn unpack(data: &[u8]) -> std::result::Result<Self, ParseError>;

    /// Encode into `out`, which is exactly `DISK_SIZE` bytes long.
    fn pack(&self, out: &mut [u8]);

    /// Reject values that cannot be represented on disk.
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// Block addresses, including the roots of nested trees.
impl ValueType for u64 {
    const DISK_SIZE: usize = 8;

    fn unpack(data: &[u8]) -> std::result::Result<Self, ParseError> {
        ensure_slice(data, 0, Self::DISK_SIZE)?;
        read_le_u64(data, 0)
    }

    fn pack(&self, out: &mut [u8]) {
        write_le_u64(out, 0, *self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_codec_is_little_endian() {
        let mut buf = [0_u8; 8];
        0x0102_0304_0506_0708_u64.pack(&mut buf);
        assert_eq!(buf, [8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(u64::unpack(&buf).unwrap(), 0x0102_0304_0506_0708);
        assert!(u64::unpack(&buf[..5]).is_err());
    }
}
