//! Reed-Solomon coding across transmission groups.
//!
//! `k` consecutive source sequences form one group; parity symbols `k..n`
//! augment them so any `k` of the `n` symbols reconstruct the sources.

use crate::error::PgmError;
use crate::sqn::Sqn;
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Systematic GF(2^8) codec for one socket's FEC parameters.
pub struct GroupCodec {
    rs: ReedSolomon,
    n: u8,
    k: u8,
    tg_sqn_shift: u8,
}

impl std::fmt::Debug for GroupCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCodec")
            .field("n", &self.n)
            .field("k", &self.k)
            .finish()
    }
}

impl GroupCodec {
    /// Validates the spec constraints: `2 <= k < n <= 255`, power-of-two `k`
    /// for group alignment, and `n - k <= k` so parity indices fit the
    /// sequence-number low field.
    pub fn new(n: u8, k: u8) -> Result<GroupCodec, PgmError> {
        if k < 2 || k >= n {
            return Err(PgmError::InvalidConfig(format!(
                "Reed-Solomon parameters out of range: n={n} k={k}"
            )));
        }
        if !k.is_power_of_two() {
            return Err(PgmError::InvalidConfig(format!(
                "transmission group size must be a power of two: k={k}"
            )));
        }
        if usize::from(n - k) > usize::from(k) {
            return Err(PgmError::InvalidConfig(format!(
                "parity count exceeds group size: n={n} k={k}"
            )));
        }
        let rs = ReedSolomon::new(usize::from(k), usize::from(n - k))
            .map_err(|e| PgmError::Fec(e.to_string()))?;
        Ok(GroupCodec {
            rs,
            n,
            k,
            tg_sqn_shift: k.trailing_zeros() as u8,
        })
    }

    pub fn n(&self) -> u8 {
        self.n
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn tg_sqn_shift(&self) -> u8 {
        self.tg_sqn_shift
    }

    /// Transmission-group leader of `sqn`.
    pub fn tg_sqn(&self, sqn: Sqn) -> Sqn {
        Sqn(sqn.0 & (u32::MAX << self.tg_sqn_shift))
    }

    /// Position of `sqn` within its group.
    pub fn tg_pkt(&self, sqn: Sqn) -> u32 {
        sqn.0 & !(u32::MAX << self.tg_sqn_shift)
    }

    /// Encode parity symbol `k + h` over the `k` equal-length source blocks.
    pub fn encode_parity(&self, sources: &[&[u8]], h: u8) -> Result<Vec<u8>, PgmError> {
        debug_assert_eq!(sources.len(), usize::from(self.k));
        debug_assert!(h < self.n - self.k);
        let len = sources[0].len();
        let mut shards: Vec<Vec<u8>> = sources.iter().map(|s| s.to_vec()).collect();
        shards.resize_with(usize::from(self.n), || vec![0u8; len]);
        self.rs
            .encode(&mut shards)
            .map_err(|e| PgmError::Fec(e.to_string()))?;
        Ok(shards.swap_remove(usize::from(self.k + h)))
    }

    /// Reconstruct the missing source shards of one group. `shards` must be
    /// `n` long, source symbols first; present entries are `Some`.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), PgmError> {
        debug_assert_eq!(shards.len(), usize::from(self.n));
        self.rs
            .reconstruct_data(shards)
            .map_err(|e| PgmError::Fec(e.to_string()))
    }
}
