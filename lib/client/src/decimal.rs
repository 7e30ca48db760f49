use std::cmp::Ordering;
use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use fixed::types::I80F48;

const SCALE_SHIFT: u32 = 16;
const SCALE_MASK: u32 = 0x00ff_0000;
const SIGN_MASK: u32 = 0x8000_0000;

pub const MAX_SCALE: u32 = 28;
const MAX_MAGNITUDE: u128 = (1u128 << 96) - 1;

/// Digits of fraction kept when converting into I80F48; finer than its 2^-48 resolution.
const FIXED_FRACTION_DIGITS: u32 = 18;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalError {
    #[error("decimal scale {0} exceeds the maximum of 28")]
    ScaleTooLarge(u32),
    #[error("decimal magnitude does not fit in 96 bits")]
    MagnitudeOverflow,
    #[error("decimal value does not fit an i64 amount with {decimals} decimals")]
    NativeOverflow { decimals: u8 },
    #[error("decimal value does not fit the fixed-point range")]
    FixedOverflow,
}

/// Fixed-point decimal in the 128-bit layout used for every ledger amount.
///
/// The four words are stored little-endian in the order `flags, hi, lo, mid`.
/// `flags` carries the sign in bit 31 and the scale in bits 16..24; the 96-bit
/// magnitude is `lo | mid << 32 | hi << 64`. The value is `magnitude / 10^scale`.
///
/// Equality is bitwise: `1.0` and `1` are different encodings. Use
/// [`Decimal::cmp_value`] to compare numerically.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Decimal {
    pub flags: u32,
    pub hi: u32,
    pub lo: u32,
    pub mid: u32,
}

impl Decimal {
    pub const ZERO: Decimal = Decimal {
        flags: 0,
        hi: 0,
        lo: 0,
        mid: 0,
    };

    pub const ENCODED_LEN: usize = 16;

    pub fn new(negative: bool, scale: u32, magnitude: u128) -> Result<Self, DecimalError> {
        if scale > MAX_SCALE {
            return Err(DecimalError::ScaleTooLarge(scale));
        }
        if magnitude > MAX_MAGNITUDE {
            return Err(DecimalError::MagnitudeOverflow);
        }
        let sign = if negative { SIGN_MASK } else { 0 };
        Ok(Self {
            flags: sign | (scale << SCALE_SHIFT),
            lo: magnitude as u32,
            mid: (magnitude >> 32) as u32,
            hi: (magnitude >> 64) as u32,
        })
    }

    /// A native integer amount expressed with `decimals` digits of scale.
    pub fn from_native(amount: i64, decimals: u8) -> Result<Self, DecimalError> {
        Self::new(amount < 0, decimals as u32, amount.unsigned_abs() as u128)
    }

    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Result<Self, DecimalError> {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let decimal = Self {
            flags: word(0),
            hi: word(4),
            lo: word(8),
            mid: word(12),
        };
        if decimal.scale() > MAX_SCALE {
            return Err(DecimalError::ScaleTooLarge(decimal.scale()));
        }
        Ok(decimal)
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.hi.to_le_bytes());
        out[8..12].copy_from_slice(&self.lo.to_le_bytes());
        out[12..16].copy_from_slice(&self.mid.to_le_bytes());
        out
    }

    pub fn scale(&self) -> u32 {
        (self.flags & SCALE_MASK) >> SCALE_SHIFT
    }

    pub fn magnitude(&self) -> u128 {
        self.lo as u128 | (self.mid as u128) << 32 | (self.hi as u128) << 64
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude() == 0
    }

    /// A set sign bit on a zero magnitude does not make the value negative.
    pub fn is_negative(&self) -> bool {
        self.flags & SIGN_MASK != 0 && !self.is_zero()
    }

    /// Converts into an integer amount with `decimals` digits. Halves round up,
    /// toward positive infinity, so -1.5 becomes -1.
    pub fn to_native_amount(&self, decimals: u8) -> Result<i64, DecimalError> {
        let scale = self.scale();
        if scale > MAX_SCALE {
            return Err(DecimalError::ScaleTooLarge(scale));
        }
        let magnitude = self.magnitude();
        let target = decimals as u32;
        let overflow = DecimalError::NativeOverflow { decimals };

        let native = if scale >= target {
            let divisor = 10u128.pow(scale - target);
            let half = divisor / 2;
            if self.is_negative() && half > 0 {
                (magnitude + half - 1) / divisor
            } else {
                (magnitude + half) / divisor
            }
        } else {
            let factor = 10u128.checked_pow(target - scale).ok_or(overflow)?;
            magnitude.checked_mul(factor).ok_or(overflow)?
        };

        let native = i64::try_from(native).map_err(|_| overflow)?;
        Ok(if self.is_negative() { -native } else { native })
    }

    /// Converts into I80F48, truncating precision below 2^-48.
    pub fn to_fixed(&self) -> Result<I80F48, DecimalError> {
        let scale = self.scale();
        if scale > MAX_SCALE {
            return Err(DecimalError::ScaleTooLarge(scale));
        }
        let magnitude = self.magnitude();
        let denominator = 10u128.pow(scale);
        let integer = magnitude / denominator;
        if integer >= 1u128 << 79 {
            return Err(DecimalError::FixedOverflow);
        }

        let mut fraction = magnitude % denominator;
        let mut fraction_denominator = denominator;
        if scale > FIXED_FRACTION_DIGITS {
            let reduce = 10u128.pow(scale - FIXED_FRACTION_DIGITS);
            fraction /= reduce;
            fraction_denominator /= reduce;
        }
        let fraction_bits = (fraction << 48) / fraction_denominator;

        let bits = ((integer << 48) | fraction_bits) as i128;
        Ok(I80F48::from_bits(if self.is_negative() { -bits } else { bits }))
    }

    fn split(&self) -> (u128, u128) {
        let scale = self.scale().min(MAX_SCALE);
        let denominator = 10u128.pow(scale);
        let remainder = self.magnitude() % denominator;
        (
            self.magnitude() / denominator,
            remainder * 10u128.pow(MAX_SCALE - scale),
        )
    }

    /// Numeric comparison across different scales.
    pub fn cmp_value(&self, other: &Self) -> Ordering {
        match (self.is_negative(), other.is_negative()) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (negative, _) => {
                let ordering = self.split().cmp(&other.split());
                if negative {
                    ordering.reverse()
                } else {
                    ordering
                }
            }
        }
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.magnitude().to_string();
        let scale = self.scale() as usize;
        let sign = if self.is_negative() { "-" } else { "" };
        if scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (integer, fraction) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{integer}.{fraction}")
    }
}

impl fmt::Debug for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() -> anyhow::Result<()> {
        let cases = [
            Decimal::ZERO,
            Decimal::new(false, 6, 1_000_000)?,
            Decimal::new(true, 8, 1_837_394_864_758_478)?,
            Decimal::new(false, 28, MAX_MAGNITUDE)?,
        ];
        for decimal in cases {
            let bytes = decimal.encode();
            assert_eq!(Decimal::decode(&bytes)?, decimal);
            assert_eq!(Decimal::try_from_slice(&bytes)?, decimal);
            assert_eq!(decimal.try_to_vec()?, bytes.to_vec());
        }
        assert_eq!(Decimal::ZERO.encode(), [0u8; 16]);
        Ok(())
    }

    #[test]
    fn test_word_order() -> anyhow::Result<()> {
        let decimal = Decimal::new(true, 3, 1 | 2 << 32 | 3 << 64)?;
        let bytes = decimal.encode();
        assert_eq!(bytes[0..4], (0x8003_0000u32).to_le_bytes());
        assert_eq!(bytes[4..8], 3u32.to_le_bytes());
        assert_eq!(bytes[8..12], 1u32.to_le_bytes());
        assert_eq!(bytes[12..16], 2u32.to_le_bytes());
        Ok(())
    }

    #[test]
    fn test_decode_rejects_large_scale() {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&(29u32 << 16).to_le_bytes());
        assert_eq!(
            Decimal::decode(&bytes),
            Err(DecimalError::ScaleTooLarge(29))
        );
        assert_eq!(
            Decimal::new(false, 29, 1),
            Err(DecimalError::ScaleTooLarge(29))
        );
    }

    #[test]
    fn test_native_amount() -> anyhow::Result<()> {
        let one = Decimal::new(false, 6, 1_000_000)?;
        assert_eq!(one.to_native_amount(6)?, 1_000_000);
        assert_eq!(one.to_native_amount(0)?, 1);
        assert_eq!(one.to_native_amount(9)?, 1_000_000_000);

        // halves round toward positive infinity
        assert_eq!(Decimal::new(false, 7, 15)?.to_native_amount(6)?, 2);
        assert_eq!(Decimal::new(false, 7, 14)?.to_native_amount(6)?, 1);
        assert_eq!(Decimal::new(true, 7, 15)?.to_native_amount(6)?, -1);
        assert_eq!(Decimal::new(true, 7, 16)?.to_native_amount(6)?, -2);
        assert_eq!(Decimal::new(true, 7, 14)?.to_native_amount(6)?, -1);
        assert_eq!(Decimal::new(true, 7, 4)?.to_native_amount(6)?, 0);
        assert_eq!(Decimal::new(true, 6, 15)?.to_native_amount(6)?, -15);

        assert_eq!(Decimal::ZERO.to_native_amount(6)?, 0);
        assert_eq!(
            Decimal::new(false, 0, MAX_MAGNITUDE)?.to_native_amount(6),
            Err(DecimalError::NativeOverflow { decimals: 6 })
        );

        let bad_scale = Decimal {
            flags: 30 << 16,
            ..Decimal::ZERO
        };
        assert_eq!(
            bad_scale.to_native_amount(6),
            Err(DecimalError::ScaleTooLarge(30))
        );
        Ok(())
    }

    #[test]
    fn test_to_fixed() -> anyhow::Result<()> {
        assert_eq!(Decimal::new(false, 1, 2)?.to_fixed()?, I80F48::from_num(0.2));
        assert_eq!(Decimal::new(true, 2, 150)?.to_fixed()?, I80F48::from_num(-1.5));
        assert_eq!(
            Decimal::new(false, 28, 10u128.pow(28))?.to_fixed()?,
            I80F48::ONE
        );
        assert_eq!(Decimal::ZERO.to_fixed()?, I80F48::ZERO);
        Ok(())
    }

    #[test]
    fn test_cmp_value() -> anyhow::Result<()> {
        let a = Decimal::new(false, 1, 10)?;
        let b = Decimal::new(false, 0, 1)?;
        assert_ne!(a, b);
        assert_eq!(a.cmp_value(&b), Ordering::Equal);

        let small = Decimal::new(false, 6, 999_999)?;
        assert_eq!(small.cmp_value(&b), Ordering::Less);

        let negative = Decimal::new(true, 2, 1)?;
        assert_eq!(negative.cmp_value(&Decimal::ZERO), Ordering::Less);
        assert_eq!(
            Decimal::new(true, 0, 2)?.cmp_value(&Decimal::new(true, 0, 1)?),
            Ordering::Less
        );
        assert_eq!(
            Decimal::new(true, 0, 0)?.cmp_value(&Decimal::ZERO),
            Ordering::Equal
        );
        Ok(())
    }

    #[test]
    fn test_display() -> anyhow::Result<()> {
        assert_eq!(
            Decimal::new(true, 8, 1_837_394_864_758_478)?.to_string(),
            "-18373948.64758478"
        );
        assert_eq!(Decimal::new(false, 6, 5)?.to_string(), "0.000005");
        assert_eq!(Decimal::new(false, 0, 42)?.to_string(), "42");
        Ok(())
    }
}
