//! Minimal unsigned 256-bit integer for targets and chain work.

use std::cmp::Ordering;
use std::fmt;

/// Little-endian 64-bit limbs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct U256([u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const ONE: U256 = U256([1, 0, 0, 0]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub fn from_u64(v: u64) -> Self {
        U256([v, 0, 0, 0])
    }

    /// Interprets 32 bytes as a little-endian number (how block hashes compare to targets).
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *limb = u64::from_le_bytes(chunk);
        }
        U256(limbs)
    }

    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, limb) in self.0.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&limb.to_le_bytes());
        }
        out
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    /// Number of significant bits.
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    fn bit(&self, n: u32) -> bool {
        (self.0[(n / 64) as usize] >> (n % 64)) & 1 == 1
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let limbs = (shift / 64) as usize;
        let bits = shift % 64;
        let mut out = [0u64; 4];
        for i in (limbs..4).rev() {
            out[i] = self.0[i - limbs] << bits;
            if bits > 0 && i > limbs {
                out[i] |= self.0[i - limbs - 1] >> (64 - bits);
            }
        }
        U256(out)
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let limbs = (shift / 64) as usize;
        let bits = shift % 64;
        let mut out = [0u64; 4];
        for i in 0..4 - limbs {
            out[i] = self.0[i + limbs] >> bits;
            if bits > 0 && i + limbs + 1 < 4 {
                out[i] |= self.0[i + limbs + 1] << (64 - bits);
            }
        }
        U256(out)
    }

    pub fn not(&self) -> Self {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }

    pub fn overflowing_add(&self, other: &Self) -> (Self, bool) {
        let mut out = [0u64; 4];
        let mut carry = false;
        for (i, slot) in out.iter_mut().enumerate() {
            let (s1, c1) = self.0[i].overflowing_add(other.0[i]);
            let (s2, c2) = s1.overflowing_add(carry as u64);
            *slot = s2;
            carry = c1 || c2;
        }
        (U256(out), carry)
    }

    pub fn saturating_add(&self, other: &Self) -> Self {
        match self.overflowing_add(other) {
            (_, true) => U256::MAX,
            (sum, false) => sum,
        }
    }

    fn wrapping_sub(&self, other: &Self) -> Self {
        let mut out = [0u64; 4];
        let mut borrow = false;
        for (i, slot) in out.iter_mut().enumerate() {
            let (d1, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (d2, b2) = d1.overflowing_sub(borrow as u64);
            *slot = d2;
            borrow = b1 || b2;
        }
        U256(out)
    }

    /// Integer division; `None` when dividing by zero.
    pub fn checked_div(&self, divisor: &Self) -> Option<Self> {
        if divisor.is_zero() {
            return None;
        }
        let mut quotient = U256::ZERO;
        let mut remainder = U256::ZERO;
        for n in (0..self.bits()).rev() {
            let carried = remainder.bit(255);
            remainder = remainder.shl(1);
            if self.bit(n) {
                remainder.0[0] |= 1;
            }
            if carried || remainder >= *divisor {
                remainder = remainder.wrapping_sub(divisor);
                quotient.0[(n / 64) as usize] |= 1 << (n % 64);
            }
        }
        Some(quotient)
    }

    /// `self * mul / div` with a 320-bit intermediate; saturates at `MAX`.
    pub fn mul_div_u64(&self, mul: u64, div: u64) -> Option<Self> {
        if div == 0 {
            return None;
        }
        let mut wide = [0u64; 5];
        let mut carry = 0u128;
        for i in 0..4 {
            let p = self.0[i] as u128 * mul as u128 + carry;
            wide[i] = p as u64;
            carry = p >> 64;
        }
        wide[4] = carry as u64;

        let mut out = [0u64; 5];
        let mut rem = 0u128;
        for i in (0..5).rev() {
            let cur = (rem << 64) | wide[i] as u128;
            out[i] = (cur / div as u128) as u64;
            rem = cur % div as u128;
        }
        if out[4] != 0 {
            return Some(U256::MAX);
        }
        Some(U256([out[0], out[1], out[2], out[3]]))
    }

    /// Decodes the compact "bits" form. Returns `None` for negative or
    /// overflowing encodings.
    pub fn from_compact(bits: u32) -> Option<Self> {
        let size = bits >> 24;
        let mut word = bits & 0x007f_ffff;
        if word != 0 && bits & 0x0080_0000 != 0 {
            return None;
        }
        if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
            return None;
        }
        if size <= 3 {
            word >>= 8 * (3 - size);
            Some(U256::from_u64(word as u64))
        } else {
            Some(U256::from_u64(word as u64).shl(8 * (size - 3)))
        }
    }

    pub fn to_compact(&self) -> u32 {
        let mut size = (self.bits() + 7) / 8;
        let mut compact = if size <= 3 {
            (self.low_u64() << (8 * (3 - size))) as u32
        } else {
            self.shr(8 * (size - 3)).low_u64() as u32
        };
        if compact & 0x0080_0000 != 0 {
            compact >>= 8;
            size += 1;
        }
        compact | (size << 24)
    }

    /// Expected number of hashes to meet `target`: 2^256 / (target + 1).
    pub fn work_for_target(target: &Self) -> Self {
        let (denominator, overflow) = target.overflowing_add(&U256::ONE);
        if overflow {
            return U256::ONE;
        }
        // (2^256 - t - 1) / (t + 1) + 1
        target
            .not()
            .checked_div(&denominator)
            .map(|q| q.saturating_add(&U256::ONE))
            .unwrap_or(U256::ONE)
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in (0..4).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Debug for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}{:016x}{:016x}{:016x}", self.0[3], self.0[2], self.0[1], self.0[0])
    }
}
