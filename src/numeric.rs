//! Fixed-point quantities used for scores and pay.
//!
//! Percentages are carried as hundredths of a percent, money as cents,
//! durations as hundredths of a second and rates as basis points. Rounding
//! happens once, half-up, where a quotient is taken.

use std::fmt;
use std::iter::Sum;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// Integer division rounding half away from zero.
pub fn div_half_up(numerator: i128, denominator: i128) -> i128 {
    debug_assert!(denominator > 0, "denominator must be positive");
    let magnitude = numerator.abs();
    let mut quotient = magnitude / denominator;
    if (magnitude % denominator) * 2 >= denominator {
        quotient += 1;
    }
    if numerator < 0 {
        -quotient
    } else {
        quotient
    }
}

fn write_fixed(f: &mut fmt::Formatter<'_>, value: i64) -> fmt::Result {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
}

/// A percentage with two decimal places (`6000` is `60.00%`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Percent(i64);

impl Percent {
    pub const ZERO: Percent = Percent(0);
    pub const HUNDRED: Percent = Percent(10_000);

    pub const fn from_hundredths(hundredths: i64) -> Self {
        Percent(hundredths)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    /// `part / whole * 100`, rounded half-up to two decimals. Zero when `whole` is zero.
    pub fn ratio(part: u64, whole: u64) -> Self {
        if whole == 0 {
            return Percent::ZERO;
        }
        Percent(div_half_up(part as i128 * 10_000, whole as i128) as i64)
    }

    /// Arithmetic mean rounded half-up to two decimals. Zero for an empty input.
    pub fn mean<I: IntoIterator<Item = Percent>>(values: I) -> Self {
        let (sum, count) = values
            .into_iter()
            .fold((0i128, 0i128), |(sum, count), value| (sum + value.0 as i128, count + 1));
        if count == 0 {
            return Percent::ZERO;
        }
        Percent(div_half_up(sum, count) as i64)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl TryFrom<f64> for Percent {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(format!("percentage must be between 0 and 100, got {value}"));
        }
        Ok(Percent((value * 100.0).round() as i64))
    }
}

impl From<Percent> for f64 {
    fn from(value: Percent) -> Self {
        value.as_f64()
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_fixed(f, self.0)
    }
}

/// A currency amount in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// `self * rate`, rounded half-up to the cent.
    pub fn apply_rate(self, rate: Rate) -> Money {
        Money(div_half_up(self.0 as i128 * rate.0 as i128, Rate::SCALE as i128) as i64)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl TryFrom<f64> for Money {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("amount must be a non-negative number, got {value}"));
        }
        Ok(Money((value * 100.0).round() as i64))
    }
}

impl From<Money> for f64 {
    fn from(value: Money) -> Self {
        value.as_f64()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_fixed(f, self.0)
    }
}

/// A multiplier in basis points (`2000` is `0.20`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Rate(i64);

impl Rate {
    pub const ZERO: Rate = Rate(0);
    const SCALE: i64 = 10_000;

    pub const fn from_basis_points(bp: i64) -> Self {
        Rate(bp)
    }

    pub const fn basis_points(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }
}

impl TryFrom<f64> for Rate {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("rate must be a non-negative number, got {value}"));
        }
        Ok(Rate((value * Self::SCALE as f64).round() as i64))
    }
}

impl From<Rate> for f64 {
    fn from(value: Rate) -> Self {
        value.as_f64()
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}

/// A duration in hundredths of a second (`1250` is `12.50s`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Seconds(i64);

impl Seconds {
    pub const ZERO: Seconds = Seconds(0);

    pub const fn from_hundredths(hundredths: i64) -> Self {
        Seconds(hundredths)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    /// `millis / count` milliseconds, rounded half-up to the hundredth.
    pub fn per_item(millis: i64, count: u64) -> Self {
        if count == 0 {
            return Seconds::ZERO;
        }
        Seconds(div_half_up(millis as i128, count as i128 * 10) as i64)
    }

    /// Arithmetic mean rounded half-up to the hundredth. Zero for an empty input.
    pub fn mean<I: IntoIterator<Item = Seconds>>(values: I) -> Self {
        let (sum, count) = values
            .into_iter()
            .fold((0i128, 0i128), |(sum, count), value| (sum + value.0 as i128, count + 1));
        if count == 0 {
            return Seconds::ZERO;
        }
        Seconds(div_half_up(sum, count) as i64)
    }

    /// True when `self < reference * rate`, compared without rounding.
    pub fn below_share_of(self, reference: Seconds, rate: Rate) -> bool {
        (self.0 as i128) * (Rate::SCALE as i128) < (reference.0 as i128) * (rate.0 as i128)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl TryFrom<f64> for Seconds {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("duration must be a non-negative number, got {value}"));
        }
        Ok(Seconds((value * 100.0).round() as i64))
    }
}

impl From<Seconds> for f64 {
    fn from(value: Seconds) -> Self {
        value.as_f64()
    }
}

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_fixed(f, self.0)
    }
}
