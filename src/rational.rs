//! Small exact-ratio type used for framerates and cursor scale factors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An exact `num/den` ratio. `den` is never zero for a value handed to a
/// public API; [`Rational::new`] normalizes the sign onto the numerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    num: i64,
    den: i64,
}

impl Rational {
    /// Builds a rational, panicking on a zero denominator — callers pass
    /// framerates and scale factors that are never computed from user input
    /// without validation first (see [`crate::error::ConfigError`]).
    pub fn new(num: i64, den: i64) -> Self {
        assert_ne!(den, 0, "Rational denominator must not be zero");
        if den < 0 {
            Rational { num: -num, den: -den }
        } else {
            Rational { num, den }
        }
    }

    pub fn num(&self) -> i64 {
        self.num
    }

    pub fn den(&self) -> i64 {
        self.den
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Reciprocal, used to invert an in/out scaler ratio.
    pub fn inverse(&self) -> Rational {
        Rational::new(self.den, self.num)
    }

    /// Multiply two rationals, as used to compose cursor scale factors
    /// across successive scaler stages (§4.3 "Cursor scaling").
    pub fn mul(&self, other: Rational) -> Rational {
        Rational::new(self.num * other.num, self.den * other.den)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl Default for Rational {
    fn default() -> Self {
        Rational { num: 0, den: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_negative_denominator() {
        let r = Rational::new(1, -2);
        assert_eq!(r.num(), -1);
        assert_eq!(r.den(), 2);
    }

    #[test]
    fn inverse_round_trips() {
        let r = Rational::new(30, 1);
        assert_eq!(r.inverse(), Rational::new(1, 30));
    }

    #[test]
    fn mul_composes_scale_ratios() {
        let in_to_mid = Rational::new(1920, 960);
        let mid_to_out = Rational::new(960, 480);
        let composed = in_to_mid.mul(mid_to_out);
        assert_eq!(composed.as_f64(), Rational::new(1920, 480).as_f64());
    }
}
