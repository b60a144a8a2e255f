//! Property-based checks for the canonical region algebra.

use core_region::{Rect, Region};
use proptest::prelude::*;

fn arb_rect() -> impl Strategy<Value = Rect> {
    (0i32..200, 0i32..200, 1i32..60, 1i32..60)
        .prop_map(|(l, t, w, h)| Rect::new(l, t, l + w, t + h))
}

fn arb_region() -> impl Strategy<Value = Region> {
    proptest::collection::vec(arb_rect(), 0..8).prop_map(|rects| {
        let mut reg = Region::new();
        for r in rects {
            reg.add(r);
        }
        reg
    })
}

proptest! {
    // Canonical form means equality is structural: rebuilding a region from
    // its own rect list reproduces it exactly.
    #[test]
    fn canonical_rebuild_is_identity(reg in arb_region()) {
        let mut rebuilt = Region::new();
        for r in reg.rects() {
            rebuilt.add(*r);
        }
        prop_assert_eq!(rebuilt, reg);
    }

    // add(R) then subtract(R) restores the prior canonical form when R was
    // disjoint from the region.
    #[test]
    fn add_subtract_disjoint_round_trip(reg in arb_region(), r in arb_rect()) {
        let mut shifted = r;
        // Move the probe rect fully out of the build area so it is disjoint.
        shifted.left += 1000;
        shifted.right += 1000;
        let before = reg.clone();
        let mut reg = reg;
        reg.add(shifted);
        reg.subtract_rect(shifted);
        prop_assert_eq!(reg, before);
    }

    #[test]
    fn union_is_commutative(a in arb_region(), b in arb_region()) {
        let mut ab = a.clone();
        ab.union(&b);
        let mut ba = b.clone();
        ba.union(&a);
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn subtract_leaves_no_intersection(a in arb_region(), b in arb_region()) {
        let mut diff = a.clone();
        diff.subtract(&b);
        prop_assert!(!diff.intersects(&b));
        prop_assert!(a.contains(&diff));
    }

    #[test]
    fn intersect_contained_in_both(a in arb_region(), b in arb_region()) {
        let mut shared = a.clone();
        shared.intersect(&b);
        prop_assert!(a.contains(&shared));
        prop_assert!(b.contains(&shared));
    }

    // area(a) = area(a\b) + area(a∩b) — the sweep never loses pixels.
    #[test]
    fn area_partition(a in arb_region(), b in arb_region()) {
        let mut diff = a.clone();
        diff.subtract(&b);
        let mut shared = a.clone();
        shared.intersect(&b);
        prop_assert_eq!(a.area(), diff.area() + shared.area());
    }

    // The classification agrees with the expensive subtract/intersect path.
    #[test]
    fn test_matches_set_ops(a in arb_region(), b in arb_region()) {
        let t = a.test(&b);
        let mut shared = a.clone();
        shared.intersect(&b);
        let mut left = a.clone();
        left.subtract(&b);
        let mut right = b.clone();
        right.subtract(&a);
        prop_assert_eq!(t.shared(), !shared.is_empty());
        prop_assert_eq!(t.left_exclusive(), !left.is_empty());
        prop_assert_eq!(t.right_exclusive(), !right.is_empty());
    }
}
