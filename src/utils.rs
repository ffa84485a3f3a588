//! Small shared utilities: lock-free float accumulators and the compressed
//! 16-bit policy format.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// An `f64` accumulator that can be updated without a surrounding lock.
///
/// Stores the bit pattern in an `AtomicU64`. Additions use a CAS loop, so
/// concurrent writers never lose an update; readers may observe a value
/// between two updates, which the visit accounting tolerates.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        AtomicF64(AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, delta: f64) {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            })
            .ok();
    }
}

/// An `f32` cell with the same discipline as [`AtomicF64`].
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        AtomicF32(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Packs a policy prior in `[0, 1]` into 16 bits: 5 bits of exponent and
/// 11 bits of significand. Values below ~6e-10 collapse to zero.
#[inline]
pub fn pack_policy(p: f32) -> u16 {
    debug_assert!((0.0..=1.0).contains(&p));
    // Rounding constant folds the half-ulp round-up and the exponent rebase
    // into one add on the raw bit pattern.
    const ROUNDINGS: i32 = (1 << 11) - (3 << 28);
    let bits = p.to_bits() as i32;
    let shifted = bits.wrapping_add(ROUNDINGS);
    if shifted < 0 {
        0
    } else {
        (shifted >> 12) as u16
    }
}

/// Inverse of [`pack_policy`].
#[inline]
pub fn unpack_policy(p: u16) -> f32 {
    if p == 0 {
        return 0.0;
    }
    let bits = ((p as u32) << 12).wrapping_add(3 << 28);
    f32::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_pack_roundtrip_endpoints() {
        assert_eq!(unpack_policy(pack_policy(0.0)), 0.0);
        assert_eq!(unpack_policy(pack_policy(1.0)), 1.0);
    }

    #[test]
    fn policy_pack_error_is_small() {
        for i in 0..=1000 {
            let p = i as f32 / 1000.0;
            let q = unpack_policy(pack_policy(p));
            assert!((p - q).abs() < 1e-3, "p={} q={}", p, q);
        }
    }

    #[test]
    fn policy_pack_is_monotone() {
        let mut last = 0;
        for i in 0..=1000 {
            let packed = pack_policy(i as f32 / 1000.0);
            assert!(packed >= last);
            last = packed;
        }
    }

    #[test]
    fn atomic_f64_accumulates() {
        let a = AtomicF64::new(1.5);
        a.add(2.25);
        a.add(-0.75);
        assert_eq!(a.load(), 3.0);
    }
}
