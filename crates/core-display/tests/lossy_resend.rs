//! Lossy-region tracking: a drawable depending on a JPEG-painted area gets
//! the area re-sent losslessly first.

mod common;

use common::{LoopTransport, bench, copy_bitmap, gradual_bitmap};
use core_canvas::cmd::{Clip, DrawCommand, DrawOp, Effect, ImageRef, Ropd, ScaleMode};
use core_dispatch::device::CommandPayload;
use core_dispatch::dispatcher::WorkerMessage;
use core_region::Rect;
use core_wire::msg::mt;
use core_wire::types::{ImageWireKind, ImageWire};

fn connect_low_bandwidth(b: &mut common::Bench) -> std::sync::Arc<common::TransportLog> {
    let (transport, log) = LoopTransport::new(false); // high latency = thin link
    b.dispatcher
        .send(WorkerMessage::DisplayConnect {
            channel_id: 0,
            transport: Box::new(transport),
            migration: false,
        })
        .unwrap();
    b.settle();
    log
}

#[test]
fn dependent_draw_preceded_by_lossless_image() {
    let mut b = bench();
    b.device.queue(common::primary_create(800, 600), 1);
    b.device.queue(common::surface_create(1, 300, 300), 2);
    b.settle();
    let log = connect_low_bandwidth(&mut b);

    // Photographic copy onto the primary: thin link makes it JPEG.
    b.device.queue(
        CommandPayload::Draw(copy_bitmap(
            0,
            Rect::new(0, 0, 200, 200),
            77,
            gradual_bitmap(200, 200, 1),
        )),
        3,
    );
    b.settle();
    let jpeg_sent = {
        let frames = log.frames.lock();
        frames.iter().any(|f| {
            f.msg_type == mt::DISPLAY_DRAW_COPY
                && image_kind_of(&f.body) == Some(ImageWireKind::Jpeg)
        })
    };
    assert!(jpeg_sent, "thin link sends gradual content as JPEG");

    let before = log.frames.lock().len();

    // Now depend on that area: copy from surface 0 into surface 1.
    let dependent = DrawCommand {
        surface_id: 1,
        bbox: Rect::new(0, 0, 100, 100),
        clip: Clip::None,
        effect: Effect::Opaque,
        op: DrawOp::Copy {
            src: ImageRef::surface(0),
            src_area: Rect::new(50, 50, 150, 150),
            rop: Ropd::PUT,
            scale_mode: ScaleMode::Nearest,
            mask: None,
        },
        mm_time: 0,
        self_bitmap_area: None,
    };
    b.device.queue(CommandPayload::Draw(dependent), 4);
    b.settle();

    // Among the new frames: a lossless draw-copy of the depended-on area
    // on surface 0 arrives before the dependent draw targeting surface 1.
    let frames = log.frames.lock();
    let new = &frames[before..];
    let resend_pos = new.iter().position(|f| {
        f.msg_type == mt::DISPLAY_DRAW_COPY
            && surface_of(&f.body) == 0
            && matches!(
                image_kind_of(&f.body),
                Some(ImageWireKind::Bitmap)
                    | Some(ImageWireKind::Quic)
                    | Some(ImageWireKind::LzRgb)
                    | Some(ImageWireKind::GlzRgb)
                    | Some(ImageWireKind::ZlibGlzRgb)
            )
    });
    let dependent_pos = new
        .iter()
        .position(|f| f.msg_type == mt::DISPLAY_DRAW_COPY && surface_of(&f.body) == 1);
    let resend = resend_pos.expect("lossless resend frame");
    let dep = dependent_pos.expect("dependent draw frame");
    assert!(
        resend < dep,
        "lossless image (pos {resend}) must precede the dependent draw (pos {dep})"
    );
}

#[test]
fn lossless_path_skips_resend() {
    let mut b = bench();
    b.device.queue(common::primary_create(800, 600), 1);
    b.device.queue(common::surface_create(1, 300, 300), 2);
    b.settle();
    // Fast link: nothing lossy, so no resend machinery fires.
    let (transport, log) = LoopTransport::new(true);
    b.dispatcher
        .send(WorkerMessage::DisplayConnect {
            channel_id: 0,
            transport: Box::new(transport),
            migration: false,
        })
        .unwrap();
    b.settle();

    b.device.queue(
        CommandPayload::Draw(copy_bitmap(
            0,
            Rect::new(0, 0, 200, 200),
            78,
            gradual_bitmap(200, 200, 2),
        )),
        3,
    );
    b.settle();
    let before = log.frames.lock().len();

    let dependent = DrawCommand {
        surface_id: 1,
        bbox: Rect::new(0, 0, 100, 100),
        clip: Clip::None,
        effect: Effect::Opaque,
        op: DrawOp::Copy {
            src: ImageRef::surface(0),
            src_area: Rect::new(50, 50, 150, 150),
            rop: Ropd::PUT,
            scale_mode: ScaleMode::Nearest,
            mask: None,
        },
        mm_time: 0,
        self_bitmap_area: None,
    };
    b.device.queue(CommandPayload::Draw(dependent), 4);
    b.settle();

    // Exactly one new draw frame for surface 1, none re-targeting 0.
    let frames = log.frames.lock();
    let new = &frames[before..];
    assert!(
        !new.iter()
            .any(|f| f.msg_type == mt::DISPLAY_DRAW_COPY && surface_of(&f.body) == 0),
        "no lossless resend on a lossless link"
    );
}

/// First 4 bytes of every draw body are the target surface id.
fn surface_of(body: &[u8]) -> u32 {
    u32::from_le_bytes(body[0..4].try_into().unwrap())
}

/// Parse the image kind out of a draw-copy body: base (4 + 16 + clip),
/// then the descriptor.
fn image_kind_of(body: &[u8]) -> Option<ImageWireKind> {
    let mut off = 4 + 16;
    match body.get(off)? {
        0 => off += 1,
        1 => {
            let n = u32::from_le_bytes(body[off + 1..off + 5].try_into().ok()?) as usize;
            off += 5 + n * 16;
        }
        _ => return None,
    }
    let img = ImageWire::unmarshal(&mut &body[off..]).ok()?;
    Some(img.descriptor.kind)
}
