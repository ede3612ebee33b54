//! Combination rule for numeric metrics that may be unavailable on some nodes.

use num_traits::Zero;

/// A numeric metric value that can be combined across nodes of a fleet
/// (or across accumulators on a single node) using [`fleet_add()`].
///
/// Negative values mean "not available". Some metrics, such as the system load average, are
/// negative on some platforms and positive on others, so a plain sum would be misleading.
pub trait FleetValue: Copy + PartialOrd + Zero {
    /// Sums two values, never panicking on overflow.
    #[must_use]
    fn sum(self, other: Self) -> Self;
}

macro_rules! impl_fleet_value_for_integer {
    ($($t:ty),*) => {
        $(
            impl FleetValue for $t {
                #[inline]
                fn sum(self, other: Self) -> Self {
                    self.saturating_add(other)
                }
            }
        )*
    };
}

impl_fleet_value_for_integer!(i32, i64);

impl FleetValue for f64 {
    #[inline]
    fn sum(self, other: Self) -> Self {
        self + other
    }
}

/// Combines two metric values where a negative value means "not available".
///
/// * If exactly one value is available (non-negative), that value is the result.
/// * If both are available, they are summed.
/// * If neither is available, the negative sentinel propagates (as the sum of both).
///
/// # Example
///
/// ```
/// use tally::fleet_add;
///
/// // Load average is unavailable on node A but available on node B.
/// assert_eq!(fleet_add(-1.0, 2.5), 2.5);
/// assert_eq!(fleet_add(1.5, 2.5), 4.0);
/// assert!(fleet_add(-1.0, -1.0) < 0.0);
/// ```
#[must_use]
#[inline]
pub fn fleet_add<T>(a: T, b: T) -> T
where
    T: FleetValue,
{
    let zero = T::zero();

    if a < zero && b >= zero {
        b
    } else if a >= zero && b < zero {
        a
    } else {
        a.sum(b)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::float_cmp, reason = "exact values are representable")]

    use super::*;

    #[test]
    fn unavailable_plus_available_is_available() {
        assert_eq!(fleet_add(-1_i64, 7), 7);
        assert_eq!(fleet_add(7_i64, -1), 7);
        assert_eq!(fleet_add(-1.0, 0.75), 0.75);
        assert_eq!(fleet_add(-1_i32, 0), 0);
    }

    #[test]
    fn available_values_are_summed() {
        assert_eq!(fleet_add(3_i64, 4), 7);
        assert_eq!(fleet_add(0.5, 0.25), 0.75);
        assert_eq!(fleet_add(0_i32, 0), 0);
    }

    #[test]
    fn unavailable_values_stay_unavailable() {
        assert!(fleet_add(-1_i64, -1) < 0);
        assert!(fleet_add(-1.0, -1.0) < 0.0);
    }

    #[test]
    fn integer_sum_saturates() {
        assert_eq!(fleet_add(i64::MAX, 1), i64::MAX);
    }
}
