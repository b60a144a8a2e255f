//! OOM relief: oldest tree items are rendered into the canvas and freed.

mod common;

use common::{LoopTransport, bench, fill};
use core_dispatch::device::CommandPayload;
use core_dispatch::dispatcher::WorkerMessage;
use core_display::render;
use core_display::worker::OOM_EVICT_BATCH;
use core_region::Rect;
use std::sync::atomic::Ordering;
use std::time::Instant;

#[test]
fn oom_evicts_batch_and_renders_first() {
    let mut b = bench();
    b.device.queue(common::primary_create(1000, 1000), 1);
    // A thousand small non-overlapping fills (100 per row band).
    let mut res = 10u64;
    for i in 0..1000i32 {
        let x = (i % 100) * 10;
        let y = (i / 100) * 10;
        b.device.queue(
            CommandPayload::Draw(fill(0, Rect::from_size(x, y, 9, 9), 0x00F000 + i as u32)),
            res,
        );
        res += 1;
    }
    // settle() may need several slices for a thousand commands.
    for _ in 0..50 {
        b.settle();
        if b.device.commands.lock().is_empty() {
            break;
        }
    }
    let before = b.worker.core.drawable_count();
    assert_eq!(before, 1000);

    b.device.flushable.store(5, Ordering::Relaxed);
    b.dispatcher.oom().unwrap();
    b.worker.tick(Instant::now());

    let after = b.worker.core.drawable_count();
    assert!(
        after <= before - OOM_EVICT_BATCH,
        "before={before} after={after}"
    );

    // The evicted (oldest) drawables were rendered before removal: the
    // very first fill's pixels are on the canvas without a flush.
    let shot = b
        .worker
        .core
        .surfaces
        .get(0)
        .canvas
        .read_bits(Rect::new(0, 0, 10, 10));
    assert_eq!(shot.pixel(4, 4) & 0x00FF_FFFF, 0x00F000);

    // Guest resources of evicted drawables went back to the device.
    assert!(b.device.released_count() >= OOM_EVICT_BATCH);
}

#[test]
fn pipe_items_survive_oom() {
    let mut b = bench();
    b.device.queue(common::primary_create(1000, 1000), 1);
    b.settle();
    let (transport, _log) = LoopTransport::new(true);
    b.dispatcher
        .send(WorkerMessage::DisplayConnect {
            channel_id: 0,
            transport: Box::new(transport),
            migration: false,
        })
        .unwrap();
    b.settle();

    // Queue fills but keep them unsent by loading a large batch in one
    // slice; whatever the pipe still holds must stay alive through OOM.
    for i in 0..200i32 {
        let x = (i % 100) * 10;
        let y = (i / 100) * 10;
        b.device.queue(
            CommandPayload::Draw(fill(0, Rect::from_size(x, y, 9, 9), 0xAA0000 + i as u32)),
            500 + i as u64,
        );
    }
    for _ in 0..50 {
        b.settle();
        if b.device.commands.lock().is_empty() {
            break;
        }
    }

    b.dispatcher.oom().unwrap();
    b.worker.tick(Instant::now());

    // Flush the rest: no dangling keys may be touched while draining.
    for _ in 0..10 {
        b.worker.tick(Instant::now());
    }
    render::flush_surface(&mut b.worker.core, 0);
    assert!(b.worker.core.drawable_count() < 200);
}
