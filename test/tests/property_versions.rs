use proptest::prelude::*;

use concord_shared::{
    try_wrapping_diff, version_greater_than, version_less_than, ContextValue, DiffOutcome,
    UpdateVersion, HALF_RANGE,
};
use concord_test::TestRecord;

proptest! {
    #[test]
    fn ordering_is_antisymmetric(a in any::<u32>(), b in any::<u32>()) {
        if a == b {
            prop_assert!(!version_greater_than(a, b));
            prop_assert!(!version_less_than(a, b));
        } else {
            // Exactly one direction holds for distinct versions.
            prop_assert!(version_greater_than(a, b) ^ version_less_than(a, b));
        }
    }

    #[test]
    fn next_is_strictly_newer_and_follows(raw in any::<u32>()) {
        let version = UpdateVersion::new(raw);
        let next = version.next();
        prop_assert!(next.follows(&version));
        prop_assert!(next.newer_than(&version));
        prop_assert!(!version.newer_than(&next));
        prop_assert!(!version.follows(&version));
    }

    #[test]
    fn wrapping_diff_reconstructs_the_target(a in any::<u32>(), b in any::<u32>()) {
        let diff = try_wrapping_diff(a, b).unwrap();
        prop_assert_eq!(a.wrapping_add(diff as u32), b);
        prop_assert_eq!(diff == 0, a == b);
        if diff > 0 {
            prop_assert!(version_greater_than(b, a));
        }
        if diff < 0 && diff.unsigned_abs() < u64::from(HALF_RANGE) {
            prop_assert!(version_less_than(b, a));
        }
    }

    #[test]
    fn record_diff_apply_round_trip(
        price in any::<i64>(),
        quantity in any::<i64>(),
        new_price in any::<i64>(),
        new_quantity in any::<i64>(),
        raw_version in any::<u32>(),
    ) {
        let mut base = TestRecord::new(price, quantity);
        base.version = UpdateVersion::new(raw_version);
        let mut candidate = base.clone();
        candidate.price = new_price;
        candidate.quantity = new_quantity;

        match base.diff_against(&candidate).unwrap() {
            None => prop_assert_eq!((price, quantity), (new_price, new_quantity)),
            Some(diff) => {
                let mut replica = base.clone();
                prop_assert_eq!(replica.apply_diff(&diff).unwrap(), DiffOutcome::Applied);
                prop_assert_eq!(replica.price, new_price);
                prop_assert_eq!(replica.quantity, new_quantity);
                prop_assert_eq!(replica.version, base.version.next());
            }
        }
    }
}
