//! Extended-range non-negative reals for deep probability chains.
//!
//! Reconciliation recurrences multiply probabilities over hundreds of tree
//! branches; plain `f64` underflows on modest inputs. [`ScaledReal`] carries
//! a mantissa plus a base-2^64 exponent and stays exact enough for argmax
//! backtracking while never hitting denormals. [`ExtendedReal`] abstracts
//! over `f64` and [`ScaledReal`] so kernels can be written once.

use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign};

/// The scaling base, 2^64.
const BASE: f64 = 18_446_744_073_709_551_616.0;
/// 2^-64.
const INV_BASE: f64 = 1.0 / BASE;
/// ln(2^64).
const LN_BASE: f64 = 64.0 * std::f64::consts::LN_2;

/// Scalar abstraction over `f64` and [`ScaledReal`].
///
/// The reconciliation kernels are generic over this trait; production code
/// instantiates [`ScaledReal`], tests exercise both.
pub trait ExtendedReal:
    Copy
    + PartialEq
    + PartialOrd
    + std::fmt::Debug
    + Add<Output = Self>
    + AddAssign
    + Mul<Output = Self>
    + MulAssign
    + Div<Output = Self>
{
    /// The additive identity.
    fn zero() -> Self;

    /// Build from a non-negative `f64`.
    fn from_f64(value: f64) -> Self;

    /// Best-effort conversion back to `f64` (may overflow to `inf` or
    /// underflow to zero for extreme exponents).
    fn to_f64(self) -> f64;

    /// Multiply by a plain `f64` factor.
    fn scale_mul(self, factor: f64) -> Self;

    /// Divide by a plain `f64` divisor.
    fn scale_div(self, divisor: f64) -> Self;

    /// `max(self - other, 0)`. The type is non-negative, so subtraction
    /// saturates at zero.
    fn saturating_sub(self, other: Self) -> Self;

    /// Natural logarithm (`-inf` for zero).
    fn ln(self) -> f64;

    /// True if the value is exactly zero.
    fn is_zero(self) -> bool;

    /// True if the value lies in `[0, 1 + 1e-6]` and is not NaN.
    fn is_probability(self) -> bool;
}

impl ExtendedReal for f64 {
    fn zero() -> Self {
        0.0
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn scale_mul(self, factor: f64) -> Self {
        self * factor
    }

    fn scale_div(self, divisor: f64) -> Self {
        self / divisor
    }

    fn saturating_sub(self, other: Self) -> Self {
        (self - other).max(0.0)
    }

    fn ln(self) -> f64 {
        f64::ln(self)
    }

    fn is_zero(self) -> bool {
        self == 0.0
    }

    fn is_probability(self) -> bool {
        !self.is_nan() && (0.0..=1.0 + 1e-6).contains(&self)
    }
}

/// A non-negative real stored as `mantissa · (2^64)^exponent`.
///
/// Non-zero values are normalized so the mantissa lies in `[2^-64, 1)`;
/// zero is represented as `(0.0, 0)`. All four arithmetic operations are
/// closed without intermediate overflow for mantissas in normal `f64`
/// range, and comparison is lexicographic on `(exponent, mantissa)` with
/// zero least.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScaledReal {
    mantissa: f64,
    exponent: i64,
}

impl ScaledReal {
    /// The zero value.
    pub fn zero() -> Self {
        Self {
            mantissa: 0.0,
            exponent: 0,
        }
    }

    /// Build from a non-negative `f64`.
    pub fn new(value: f64) -> Self {
        debug_assert!(value >= 0.0, "ScaledReal is non-negative, got {}", value);
        Self::normalized(value, 0)
    }

    /// The normalized mantissa (in `[2^-64, 1)`, or 0).
    pub fn mantissa(&self) -> f64 {
        self.mantissa
    }

    /// The base-2^64 exponent.
    pub fn exponent(&self) -> i64 {
        self.exponent
    }

    fn normalized(mut mantissa: f64, mut exponent: i64) -> Self {
        if mantissa == 0.0 {
            return Self::zero();
        }
        while mantissa >= 1.0 {
            mantissa *= INV_BASE;
            exponent += 1;
        }
        while mantissa < INV_BASE {
            mantissa *= BASE;
            exponent -= 1;
        }
        Self { mantissa, exponent }
    }
}

impl Add for ScaledReal {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        if self.mantissa == 0.0 {
            return other;
        }
        if other.mantissa == 0.0 {
            return self;
        }
        let (hi, lo) = if self.exponent >= other.exponent {
            (self, other)
        } else {
            (other, self)
        };
        let shift = lo.exponent - hi.exponent;
        // Past two base steps the smaller addend is below f64 precision
        // relative to the larger.
        match shift {
            0 => Self::normalized(hi.mantissa + lo.mantissa, hi.exponent),
            -1 => Self::normalized(hi.mantissa + lo.mantissa * INV_BASE, hi.exponent),
            _ => hi,
        }
    }
}

impl AddAssign for ScaledReal {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Mul for ScaledReal {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        Self::normalized(self.mantissa * other.mantissa, self.exponent + other.exponent)
    }
}

impl MulAssign for ScaledReal {
    fn mul_assign(&mut self, other: Self) {
        *self = *self * other;
    }
}

impl Div for ScaledReal {
    type Output = Self;

    fn div(self, other: Self) -> Self {
        debug_assert!(other.mantissa != 0.0, "ScaledReal division by zero");
        Self::normalized(self.mantissa / other.mantissa, self.exponent - other.exponent)
    }
}

impl PartialOrd for ScaledReal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.mantissa.is_nan() || other.mantissa.is_nan() {
            return None;
        }
        match (self.mantissa == 0.0, other.mantissa == 0.0) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => match self.exponent.cmp(&other.exponent) {
                Ordering::Equal => self.mantissa.partial_cmp(&other.mantissa),
                ordering => Some(ordering),
            },
        }
    }
}

impl ExtendedReal for ScaledReal {
    fn zero() -> Self {
        ScaledReal::zero()
    }

    fn from_f64(value: f64) -> Self {
        ScaledReal::new(value)
    }

    fn to_f64(self) -> f64 {
        if self.mantissa == 0.0 {
            return 0.0;
        }
        let exp = (self.exponent * 64).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        self.mantissa * 2.0_f64.powi(exp)
    }

    fn scale_mul(self, factor: f64) -> Self {
        debug_assert!(factor >= 0.0);
        Self::normalized(self.mantissa * factor, self.exponent)
    }

    fn scale_div(self, divisor: f64) -> Self {
        debug_assert!(divisor > 0.0);
        Self::normalized(self.mantissa / divisor, self.exponent)
    }

    fn saturating_sub(self, other: Self) -> Self {
        if other.mantissa == 0.0 {
            return self;
        }
        if other >= self {
            return Self::zero();
        }
        let shift = other.exponent - self.exponent;
        let reduced = match shift {
            0 => self.mantissa - other.mantissa,
            -1 => self.mantissa - other.mantissa * INV_BASE,
            _ => self.mantissa,
        };
        if reduced <= 0.0 {
            return Self::zero();
        }
        Self::normalized(reduced, self.exponent)
    }

    fn ln(self) -> f64 {
        if self.mantissa == 0.0 {
            return f64::NEG_INFINITY;
        }
        self.mantissa.ln() + self.exponent as f64 * LN_BASE
    }

    fn is_zero(self) -> bool {
        self.mantissa == 0.0
    }

    fn is_probability(self) -> bool {
        if self.mantissa.is_nan() {
            return false;
        }
        self <= ScaledReal::new(1.0 + 1e-6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-10;

    #[test]
    fn zero_is_normalized() {
        let z = ScaledReal::zero();
        assert_eq!(z.mantissa(), 0.0);
        assert_eq!(z.exponent(), 0);
        assert!(z.is_zero());
    }

    #[test]
    fn one_roundtrips() {
        let one = ScaledReal::new(1.0);
        assert!((one.to_f64() - 1.0).abs() < TOL);
        assert!((ExtendedReal::ln(one)).abs() < TOL);
    }

    #[test]
    fn mantissa_stays_normalized() {
        let v = ScaledReal::new(0.3) * ScaledReal::new(0.7);
        assert!(v.mantissa() >= INV_BASE && v.mantissa() < 1.0);
        assert!((v.to_f64() - 0.21).abs() < TOL);
    }

    #[test]
    fn addition_matches_f64() {
        let a = ScaledReal::new(0.25);
        let b = ScaledReal::new(0.5);
        assert!(((a + b).to_f64() - 0.75).abs() < TOL);
    }

    #[test]
    fn addition_with_zero_is_identity() {
        let a = ScaledReal::new(0.42);
        assert_eq!(a + ScaledReal::zero(), a);
        assert_eq!(ScaledReal::zero() + a, a);
    }

    #[test]
    fn tiny_addend_is_absorbed() {
        let big = ScaledReal::new(0.5);
        let mut tiny = ScaledReal::new(0.5);
        for _ in 0..50 {
            tiny = tiny * ScaledReal::new(1e-30);
        }
        let sum = big + tiny;
        assert!((sum.to_f64() - 0.5).abs() < TOL);
    }

    #[test]
    fn deep_product_does_not_underflow() {
        let mut product = ScaledReal::new(1.0);
        for _ in 0..1000 {
            product = product.scale_mul(0.1);
        }
        // f64 would have underflowed around 10^-308.
        let expected_ln = 1000.0 * 0.1_f64.ln();
        assert!((ExtendedReal::ln(product) - expected_ln).abs() < 1e-6);
        assert!(!product.is_zero());
    }

    #[test]
    fn division_inverts_multiplication() {
        let a = ScaledReal::new(0.3);
        let b = ScaledReal::new(0.004);
        let restored = (a * b) / b;
        assert!((restored.to_f64() - 0.3).abs() < TOL);
    }

    #[test]
    fn scale_ops_match_f64() {
        let a = ScaledReal::new(0.6);
        assert!((a.scale_mul(0.5).to_f64() - 0.3).abs() < TOL);
        assert!((a.scale_div(2.0).to_f64() - 0.3).abs() < TOL);
    }

    #[test]
    fn comparison_is_total_on_values() {
        let small = ScaledReal::new(1e-300) * ScaledReal::new(1e-300);
        let large = ScaledReal::new(0.9);
        assert!(small < large);
        assert!(large > small);
        assert!(ScaledReal::zero() < small);
        assert!(ScaledReal::new(0.5) == ScaledReal::new(0.5));
    }

    #[test]
    fn saturating_sub_basic() {
        let a = ScaledReal::new(0.8);
        let b = ScaledReal::new(0.3);
        assert!((a.saturating_sub(b).to_f64() - 0.5).abs() < TOL);
        assert!(b.saturating_sub(a).is_zero());
        assert_eq!(a.saturating_sub(ScaledReal::zero()), a);
    }

    #[test]
    fn saturating_sub_across_exponents() {
        let mut small = ScaledReal::new(0.5);
        for _ in 0..10 {
            small = small.scale_mul(1e-30);
        }
        let big = ScaledReal::new(0.5);
        let diff = big.saturating_sub(small);
        assert!((diff.to_f64() - 0.5).abs() < TOL);
    }

    #[test]
    fn ln_of_zero_is_neg_infinity() {
        assert_eq!(ExtendedReal::ln(ScaledReal::zero()), f64::NEG_INFINITY);
    }

    #[test]
    fn probability_check() {
        assert!(ScaledReal::new(0.0).is_probability());
        assert!(ScaledReal::new(1.0).is_probability());
        assert!(ScaledReal::new(1.0 + 5e-7).is_probability());
        assert!(!ScaledReal::new(1.1).is_probability());
    }

    #[test]
    fn f64_impl_is_consistent() {
        let a: f64 = ExtendedReal::from_f64(0.25);
        assert_eq!(a.scale_mul(2.0), 0.5);
        assert_eq!(a.saturating_sub(0.5), 0.0);
        assert!(a.is_probability());
        assert!(!f64::NAN.is_probability());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn positive_prob() -> impl Strategy<Value = f64> {
        1e-12_f64..1.0
    }

    proptest! {
        #[test]
        fn mul_matches_f64(a in positive_prob(), b in positive_prob()) {
            let scaled = (ScaledReal::new(a) * ScaledReal::new(b)).to_f64();
            prop_assert!((scaled - a * b).abs() <= 1e-12 * (a * b).max(1e-300));
        }

        #[test]
        fn add_matches_f64(a in positive_prob(), b in positive_prob()) {
            let scaled = (ScaledReal::new(a) + ScaledReal::new(b)).to_f64();
            prop_assert!((scaled - (a + b)).abs() <= 1e-9 * (a + b));
        }

        #[test]
        fn ordering_matches_f64(a in positive_prob(), b in positive_prob()) {
            let (sa, sb) = (ScaledReal::new(a), ScaledReal::new(b));
            prop_assert_eq!(sa.partial_cmp(&sb), a.partial_cmp(&b));
        }

        #[test]
        fn ln_matches_f64(a in positive_prob()) {
            prop_assert!((ExtendedReal::ln(ScaledReal::new(a)) - a.ln()).abs() < 1e-9);
        }
    }
}
