//! Property tests for sidecar naming, slot ranges and facet ordering.

use proptest::prelude::*;
use snapshot_browser::services::sidecar::{
    self, FIRST_SLOT_RANGE, compare_slot_ranges, compare_versions, extract_slot_and_node,
    slot_range,
};
use std::cmp::Ordering;

proptest! {
    #[test]
    fn conventional_names_round_trip(slot in 1u64.., node in "[A-Za-z0-9]{1,44}") {
        let key = format!("snapshot-{}-{}.json", slot, node);
        prop_assert!(sidecar::is_sidecar(&key));
        prop_assert!(sidecar::classify(&key).is_metadata);
        prop_assert!(!sidecar::classify(&key).is_archive);
        prop_assert_eq!(extract_slot_and_node(&key), (slot, node));
    }

    #[test]
    fn archives_are_never_sidecars(slot in any::<u64>(), node in "[A-Za-z0-9]{1,44}") {
        let key = format!("snapshot-{}-{}.tar.gz", slot, node);
        let class = sidecar::classify(&key);
        prop_assert!(class.is_archive);
        prop_assert!(!class.is_metadata);
        prop_assert_eq!(extract_slot_and_node(&key), (0, String::new()));
    }

    #[test]
    fn underscore_delimiter_is_rejected(slot in any::<u64>(), node in "[A-Za-z0-9]{1,44}") {
        let key = format!("snapshot_{}_{}.json", slot, node);
        prop_assert!(!sidecar::is_sidecar(&key));
        prop_assert_eq!(extract_slot_and_node(&key), (0, String::new()));
    }

    #[test]
    fn slot_range_contains_slot(slot in any::<u64>()) {
        let label = slot_range(slot);
        if slot < 1_000_000 {
            prop_assert_eq!(label, FIRST_SLOT_RANGE);
        } else {
            let millions = slot / 1_000_000;
            prop_assert_eq!(label, format!("{}M-{}M", millions, millions + 1));
        }
    }

    #[test]
    fn slot_range_order_follows_slots(a in any::<u64>(), b in any::<u64>()) {
        let (ra, rb) = (slot_range(a), slot_range(b));
        let by_window = (a / 1_000_000).cmp(&(b / 1_000_000));
        prop_assert_eq!(compare_slot_ranges(&ra, &rb), by_window);
    }

    #[test]
    fn version_order_is_antisymmetric(
        a in "[0-9a-z]{1,3}(\\.[0-9a-z]{1,3}){0,3}",
        b in "[0-9a-z]{1,3}(\\.[0-9a-z]{1,3}){0,3}",
    ) {
        prop_assert_eq!(compare_versions(&a, &b), compare_versions(&b, &a).reverse());
        prop_assert_eq!(compare_versions(&a, &b) == Ordering::Equal, a == b);
    }

    #[test]
    fn numeric_versions_sort_numerically(
        x in (0u64..50, 0u64..50, 0u64..50),
        y in (0u64..50, 0u64..50, 0u64..50),
    ) {
        let a = format!("{}.{}.{}", x.0, x.1, x.2);
        let b = format!("{}.{}.{}", y.0, y.1, y.2);
        prop_assert_eq!(compare_versions(&a, &b), x.cmp(&y));
    }
}
