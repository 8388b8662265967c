use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Half of the representable `u32` range; the pivot of the wrap-aware
/// comparison rule.
pub const HALF_RANGE: u32 = 2_147_483_648;

/// Errors that can occur during wrapping version operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WrappingVersionError {
    /// Integer overflow occurred during wrapping difference calculation.
    /// This should be mathematically impossible with valid u32 inputs.
    #[error("Integer overflow in wrapping_diff({a}, {b}) - this should not happen")]
    IntegerOverflow { a: u32, b: u32 },
}

/// Returns whether or not a wrapping version is greater than another.
/// Two versions more than half the counter range apart are treated as
/// having wrapped.
/// version_greater_than(2,1) will return true
/// version_greater_than(1,2) will return false
/// version_greater_than(1,1) will return false
pub fn version_greater_than(v1: u32, v2: u32) -> bool {
    ((v1 > v2) && (v1 - v2 <= HALF_RANGE)) || ((v1 < v2) && (v2 - v1 > HALF_RANGE))
}

/// Returns whether or not a wrapping version is less than another
/// version_less_than(1,2) will return true
/// version_less_than(2,1) will return false
/// version_less_than(1,1) will return false
pub fn version_less_than(v1: u32, v2: u32) -> bool {
    version_greater_than(v2, v1)
}

/// Retrieves the wrapping difference between 2 u32 values.
/// Returns an error if an impossible integer overflow occurs.
pub fn try_wrapping_diff(a: u32, b: u32) -> Result<i64, WrappingVersionError> {
    const MAX: i64 = i32::MAX as i64;
    const MIN: i64 = i32::MIN as i64;
    const ADJUST: i64 = (u32::MAX as i64) + 1;

    let a_i64 = i64::from(a);
    let b_i64 = i64::from(b);

    let mut result = b_i64 - a_i64;
    if (MIN..=MAX).contains(&result) {
        Ok(result)
    } else if b_i64 > a_i64 {
        result = b_i64 - (a_i64 + ADJUST);
        if (MIN..=MAX).contains(&result) {
            Ok(result)
        } else {
            Err(WrappingVersionError::IntegerOverflow { a, b })
        }
    } else {
        result = (b_i64 + ADJUST) - a_i64;
        if (MIN..=MAX).contains(&result) {
            Ok(result)
        } else {
            Err(WrappingVersionError::IntegerOverflow { a, b })
        }
    }
}

/// Retrieves the wrapping difference between 2 u32 values.
///
/// # Panics
///
/// Panics if an impossible integer overflow occurs (this should never happen
/// with valid u32 inputs).
pub fn wrapping_diff(a: u32, b: u32) -> i64 {
    try_wrapping_diff(a, b).expect("integer overflow in wrapping_diff - this should not happen")
}

/// A wrapping 32-bit sequence number carried by every diff-capable value.
/// Lives in a fixed-width field indefinitely; comparisons use the half-range
/// rule so overflow never causes false ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UpdateVersion(u32);

impl UpdateVersion {
    pub const ZERO: UpdateVersion = UpdateVersion(0);

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// The version immediately following this one, wrapping at the range end.
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Wrap-aware ordering between two versions.
    pub fn cmp_wrapping(&self, other: &Self) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        } else if version_greater_than(self.0, other.0) {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }

    /// Whether this version is strictly newer than `other`, wrap-aware.
    pub fn newer_than(&self, other: &Self) -> bool {
        version_greater_than(self.0, other.0)
    }

    /// Whether this version immediately follows `other`.
    pub fn follows(&self, other: &Self) -> bool {
        other.next() == *self
    }
}

impl fmt::Display for UpdateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
