//! Occlusion-tree scenarios: overlap splitting, copy-bits shadows, and the
//! opaque-disjointness invariant.

mod common;

use common::{bench, copy_bits, fill};
use core_dispatch::device::CommandPayload;
use core_region::{Point, Rect, Region};

use core_display::render;
use core_display::tree::{TreeKind, draw_items_in_order};
use core_display::worker::tree_item_count;

fn pixel(bmp: &core_canvas::Bitmap, x: u32, y: u32) -> u32 {
    bmp.pixel(x, y) & 0x00FF_FFFF
}

#[test]
fn fill_then_overlap_splits_regions() {
    let mut b = bench();
    b.device.queue(common::primary_create(800, 600), 1);
    b.device
        .queue(CommandPayload::Draw(fill(0, Rect::new(0, 0, 100, 100), 0xFF0000)), 2);
    b.device
        .queue(CommandPayload::Draw(fill(0, Rect::new(50, 50, 150, 150), 0x00FF00)), 3);
    b.settle();

    // Tree: the second fill sits on top with its full region; the first
    // kept only the un-occluded L-shape.
    let items = draw_items_in_order(&b.worker.core, 0);
    assert_eq!(items.len(), 2);
    let first = &b.worker.core.items[items[0]];
    let second = &b.worker.core.items[items[1]];
    let mut expect_first = Region::from_rect(Rect::new(0, 0, 100, 100));
    expect_first.subtract_rect(Rect::new(50, 50, 150, 150));
    assert_eq!(first.region, expect_first);
    assert_eq!(
        second.region,
        Region::from_rect(Rect::new(50, 50, 150, 150))
    );

    // Opaque siblings stay pairwise disjoint.
    assert!(!first.region.intersects(&second.region));

    // Rendered pixels match the command order.
    let shot = render::get_area(&mut b.worker.core, 0, Rect::new(0, 0, 200, 200));
    assert_eq!(pixel(&shot, 25, 25), 0xFF0000);
    assert_eq!(pixel(&shot, 75, 75), 0x00FF00);
    assert_eq!(pixel(&shot, 125, 125), 0x00FF00);
    assert_eq!(pixel(&shot, 125, 25), 0x000000);
}

#[test]
fn copy_bits_grows_shadow_and_keeps_pixels() {
    let mut b = bench();
    b.device.queue(common::primary_create(400, 200), 1);
    // Red at the source area.
    b.device
        .queue(CommandPayload::Draw(fill(0, Rect::new(0, 0, 100, 100), 0xFF0000)), 2);
    // Copy it to the right.
    b.device.queue(
        CommandPayload::Draw(copy_bits(0, Rect::new(100, 0, 200, 100), Point::new(0, 0))),
        3,
    );
    b.settle();

    // A shadow at the source location exists.
    let shadow_count = b
        .worker
        .core
        .items
        .iter()
        .filter(|(_, item)| matches!(item.kind, TreeKind::Shadow(_)))
        .count();
    assert_eq!(shadow_count, 1);

    // Overpaint the top band across source and destination.
    b.device
        .queue(CommandPayload::Draw(fill(0, Rect::new(0, 0, 200, 50), 0x0000FF)), 4);
    b.settle();

    // The shadow holds the exclusion that landed on the source.
    let on_hold: Vec<Region> = b
        .worker
        .core
        .items
        .iter()
        .filter_map(|(_, item)| match &item.kind {
            TreeKind::Shadow(s) => Some(s.on_hold.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(on_hold.len(), 1);
    assert_eq!(on_hold[0], Region::from_rect(Rect::new(0, 0, 100, 50)));

    // Rendering stays exact despite the deferral.
    let shot = render::get_area(&mut b.worker.core, 0, Rect::new(0, 0, 400, 200));
    assert_eq!(pixel(&shot, 150, 75), 0xFF0000, "copied red survives");
    assert_eq!(pixel(&shot, 50, 75), 0xFF0000, "source red below the band");
    assert_eq!(pixel(&shot, 50, 25), 0x0000FF, "overpaint on top");
    assert_eq!(pixel(&shot, 150, 25), 0x0000FF, "overpaint over the copy");
}

#[test]
fn full_cover_removes_older_items() {
    let mut b = bench();
    b.device.queue(common::primary_create(300, 300), 1);
    for i in 0..5 {
        b.device.queue(
            CommandPayload::Draw(fill(0, Rect::new(10 * i, 10 * i, 100, 100), 0x111111 * i as u32)),
            10 + i as u64,
        );
    }
    // One opaque fill covering everything.
    b.device
        .queue(CommandPayload::Draw(fill(0, Rect::new(0, 0, 300, 300), 0xABCDEF)), 99);
    b.settle();

    let items = draw_items_in_order(&b.worker.core, 0);
    assert_eq!(items.len(), 1, "everything below the cover is gone");
    assert_eq!(tree_item_count(&b.worker.core, 0), 1);

    let shot = render::get_area(&mut b.worker.core, 0, Rect::new(0, 0, 300, 300));
    assert_eq!(pixel(&shot, 5, 5), 0xABCDEF);
}

#[test]
fn contained_item_builds_container() {
    let mut b = bench();
    b.device.queue(common::primary_create(300, 300), 1);
    b.device
        .queue(CommandPayload::Draw(fill(0, Rect::new(0, 0, 200, 200), 0x101010)), 2);
    // Strictly inside the first: promotes the first into a container.
    b.device
        .queue(CommandPayload::Draw(fill(0, Rect::new(50, 50, 100, 100), 0x202020)), 3);
    b.settle();

    let containers = b
        .worker
        .core
        .items
        .iter()
        .filter(|(_, item)| matches!(item.kind, TreeKind::Container(_)))
        .count();
    assert_eq!(containers, 1);

    let items = draw_items_in_order(&b.worker.core, 0);
    assert_eq!(items.len(), 2);
    // The outer item lost the inner region.
    let outer = &b.worker.core.items[items[0]];
    let mut expect = Region::from_rect(Rect::new(0, 0, 200, 200));
    expect.subtract_rect(Rect::new(50, 50, 100, 100));
    assert_eq!(outer.region, expect);
}

#[test]
fn opaque_regions_pairwise_disjoint_after_random_fills() {
    let mut b = bench();
    b.device.queue(common::primary_create(400, 400), 1);
    let mut x = 9u32;
    for i in 0..40 {
        x = x.wrapping_mul(1664525).wrapping_add(1013904223);
        let left = (x >> 8) as i32 % 300;
        let top = (x >> 16) as i32 % 300;
        let w = 20 + (x % 80) as i32;
        let h = 20 + ((x >> 4) % 80) as i32;
        b.device.queue(
            CommandPayload::Draw(fill(0, Rect::new(left, top, left + w, top + h), x)),
            100 + i,
        );
    }
    b.settle();

    let items = draw_items_in_order(&b.worker.core, 0);
    for (i, &a) in items.iter().enumerate() {
        for &c in items.iter().skip(i + 1) {
            let ra = &b.worker.core.items[a].region;
            let rc = &b.worker.core.items[c].region;
            assert!(
                !ra.intersects(rc),
                "opaque sibling regions must stay disjoint"
            );
        }
    }
}

#[test]
fn add_then_flush_restores_empty_tree() {
    let mut b = bench();
    b.device.queue(common::primary_create(100, 100), 1);
    b.device
        .queue(CommandPayload::Draw(fill(0, Rect::new(0, 0, 50, 50), 0x123456)), 2);
    b.settle();
    assert_eq!(draw_items_in_order(&b.worker.core, 0).len(), 1);

    render::flush_surface(&mut b.worker.core, 0);
    assert_eq!(draw_items_in_order(&b.worker.core, 0).len(), 0);
    assert_eq!(b.worker.core.drawable_count(), 0, "all drawables released");

    let shot = render::get_area(&mut b.worker.core, 0, Rect::new(0, 0, 50, 50));
    assert_eq!(pixel(&shot, 10, 10), 0x123456);
}
