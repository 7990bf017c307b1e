//! CRC64 checksum primitive.
//!
//! Azure Storage's transactional CRC64 is the reflected ECMA-182 variant
//! with all-ones init and xorout, which is the CRC-64/NVME parameter set.
//! `crc64fast-nvme` provides the SIMD-accelerated implementation.

use crc64fast_nvme::Digest;

/// Compute the CRC64 of `data` in one shot.
pub fn compute(data: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(data);
    digest.sum64()
}

/// Running CRC64 accumulator.
///
/// Feeding bytes through any number of [`Crc64::update`] calls yields the
/// same value as a single [`compute`] over their concatenation.
pub struct Crc64 {
    digest: Digest,
    len: u64,
}

impl Crc64 {
    pub fn new() -> Self {
        Self {
            digest: Digest::new(),
            len: 0,
        }
    }

    /// Fold `data` into the running checksum.
    pub fn update(&mut self, data: &[u8]) {
        self.digest.write(data);
        self.len += data.len() as u64;
    }

    /// Current checksum value. Does not consume the accumulator.
    pub fn value(&self) -> u64 {
        self.digest.sum64()
    }

    /// Number of bytes folded in so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Restart from the empty checksum.
    pub fn reset(&mut self) {
        self.digest = Digest::new();
        self.len = 0;
    }
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Crc64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc64")
            .field("value", &format_args!("{:#018x}", self.value()))
            .field("len", &self.len)
            .finish()
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(compute(b"123456789"), 0xAE8B_1486_0A79_9888);
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(compute(&[]), 0);
        assert_eq!(Crc64::new().value(), 0);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();
        for split in [0usize, 1, 7, 500, 999, 1000] {
            let mut crc = Crc64::new();
            crc.update(&data[..split]);
            crc.update(&data[split..]);
            assert_eq!(crc.value(), compute(&data), "split at {split}");
            assert_eq!(crc.len(), 1000);
        }
    }

    #[test]
    fn test_value_is_non_consuming() {
        let mut crc = Crc64::new();
        crc.update(b"abc");
        let first = crc.value();
        assert_eq!(crc.value(), first);
        crc.update(b"def");
        assert_eq!(crc.value(), compute(b"abcdef"));
    }

    #[test]
    fn test_reset() {
        let mut crc = Crc64::new();
        crc.update(b"garbage");
        crc.reset();
        assert!(crc.is_empty());
        crc.update(b"123456789");
        assert_eq!(crc.value(), 0xAE8B_1486_0A79_9888);
    }
}
