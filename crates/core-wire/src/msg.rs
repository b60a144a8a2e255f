//! Message bodies, server→client and client→server.
//!
//! Server→client messages marshal only (this is the sending side); the
//! client→server set the display channel consumes parses both ways so the
//! read loop can be tested against hand-marshalled frames.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core_region::{Point, Rect};
use std::io::{self, Read, Write};

use crate::WireError;
use crate::types::{ClipWire, ImageWire, WireWaitForChannels, put_point, put_rect};

/// Server→client message type codes. Channel-common codes sit below 100,
/// display codes from 100, draw commands from 300.
pub mod mt {
    pub const SET_ACK: u16 = 1;
    pub const MIGRATE: u16 = 2;
    pub const MIGRATE_DATA: u16 = 3;
    pub const WAIT_FOR_CHANNELS: u16 = 5;

    pub const DISPLAY_MARK: u16 = 101;
    pub const DISPLAY_RESET: u16 = 102;
    pub const DISPLAY_INVAL_ONE: u16 = 103;
    pub const DISPLAY_INVAL_ALL_PIXMAPS: u16 = 104;
    pub const DISPLAY_INVAL_PALETTE: u16 = 105;
    pub const DISPLAY_INVAL_ALL_PALETTES: u16 = 106;
    pub const DISPLAY_SURFACE_CREATE: u16 = 110;
    pub const DISPLAY_SURFACE_DESTROY: u16 = 111;
    pub const DISPLAY_STREAM_CREATE: u16 = 120;
    pub const DISPLAY_STREAM_DATA: u16 = 121;
    pub const DISPLAY_STREAM_CLIP: u16 = 122;
    pub const DISPLAY_STREAM_DESTROY: u16 = 123;
    pub const DISPLAY_STREAM_DESTROY_ALL: u16 = 124;

    pub const DISPLAY_DRAW_FILL: u16 = 302;
    pub const DISPLAY_DRAW_OPAQUE: u16 = 303;
    pub const DISPLAY_DRAW_COPY: u16 = 304;
    pub const DISPLAY_DRAW_BLEND: u16 = 305;
    pub const DISPLAY_DRAW_BLACKNESS: u16 = 306;
    pub const DISPLAY_DRAW_WHITENESS: u16 = 307;
    pub const DISPLAY_DRAW_INVERS: u16 = 308;
    pub const DISPLAY_DRAW_ROP3: u16 = 309;
    pub const DISPLAY_DRAW_STROKE: u16 = 310;
    pub const DISPLAY_DRAW_TEXT: u16 = 311;
    pub const DISPLAY_DRAW_TRANSPARENT: u16 = 312;
    pub const DISPLAY_DRAW_ALPHA_BLEND: u16 = 313;
    pub const DISPLAY_COPY_BITS: u16 = 314;

    pub const CURSOR_INIT: u16 = 201;
    pub const CURSOR_RESET: u16 = 202;
    pub const CURSOR_SET: u16 = 203;
    pub const CURSOR_MOVE: u16 = 204;
    pub const CURSOR_HIDE: u16 = 205;
    pub const CURSOR_TRAIL: u16 = 206;
    pub const CURSOR_INVAL_ONE: u16 = 207;
    pub const CURSOR_INVAL_ALL: u16 = 208;
}

/// Client→server type codes.
pub mod cmt {
    pub const ACK_SYNC: u16 = 1;
    pub const ACK: u16 = 2;
    pub const MIGRATE_FLUSH_MARK: u16 = 4;
    pub const MIGRATE_DATA: u16 = 5;
    pub const DISCONNECTING: u16 = 6;
    pub const DISPLAY_INIT: u16 = 101;
}

/// Common prefix of every draw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawBase {
    pub surface_id: u32,
    pub bbox: Rect,
    pub clip: ClipWire,
}

impl DrawBase {
    fn marshal<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.surface_id)?;
        put_rect(w, &self.bbox)?;
        self.clip.marshal(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrushWire {
    None,
    Solid(u32),
    Pattern { image: ImageWire, pos: Point },
}

impl BrushWire {
    fn marshal<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            BrushWire::None => w.write_u8(0),
            BrushWire::Solid(c) => {
                w.write_u8(1)?;
                w.write_u32::<LittleEndian>(*c)
            }
            BrushWire::Pattern { image, pos } => {
                w.write_u8(2)?;
                image.marshal(w)?;
                put_point(w, pos)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskWire {
    pub invers: bool,
    pub pos: Point,
    pub image: ImageWire,
}

fn put_mask<W: Write>(w: &mut W, mask: &Option<MaskWire>) -> io::Result<()> {
    match mask {
        None => w.write_u8(0),
        Some(m) => {
            w.write_u8(1)?;
            w.write_u8(m.invers as u8)?;
            put_point(w, &m.pos)?;
            m.image.marshal(w)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphWire {
    pub render_pos: Point,
    pub width: u16,
    pub height: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrokeSegWire {
    pub closed: bool,
    pub points: Vec<Point>,
}

/// Cursor shape payload (alpha cursor bits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorShapeWire {
    pub id: u64,
    pub width: u16,
    pub height: u16,
    pub hot: Point,
    pub cache_me: bool,
    pub from_cache: bool,
    pub data: Vec<u8>,
}

impl CursorShapeWire {
    fn marshal<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.id)?;
        w.write_u16::<LittleEndian>(self.width)?;
        w.write_u16::<LittleEndian>(self.height)?;
        put_point(w, &self.hot)?;
        w.write_u8(self.cache_me as u8)?;
        w.write_u8(self.from_cache as u8)?;
        w.write_u32::<LittleEndian>(self.data.len() as u32)?;
        w.write_all(&self.data)
    }
}

/// Every message the display channel sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayMsg {
    SetAck { generation: u32, window: u32 },
    Migrate { flags: u32 },
    MigrateData { data: Vec<u8> },
    WaitForChannels(WireWaitForChannels),

    Mark,
    Reset,
    InvalOne { id: u64 },
    InvalAllPixmaps { wait: WireWaitForChannels },
    InvalPalette { id: u64 },
    InvalAllPalettes,
    SurfaceCreate {
        surface_id: u32,
        width: u32,
        height: u32,
        format: u8,
        primary: bool,
    },
    SurfaceDestroy { surface_id: u32 },

    StreamCreate {
        id: u32,
        flags: u8,
        codec: u8,
        dest: Rect,
        src_width: u32,
        src_height: u32,
        clip: ClipWire,
    },
    StreamData { id: u32, mm_time: u32, data: Vec<u8> },
    StreamClip { id: u32, clip: ClipWire },
    StreamDestroy { id: u32 },
    StreamDestroyAll,

    DrawFill {
        base: DrawBase,
        brush: BrushWire,
        rop: u16,
        mask: Option<MaskWire>,
    },
    DrawOpaque {
        base: DrawBase,
        image: ImageWire,
        src_area: Rect,
        brush: BrushWire,
        rop: u16,
        mask: Option<MaskWire>,
    },
    DrawCopy {
        base: DrawBase,
        image: ImageWire,
        src_area: Rect,
        rop: u16,
        mask: Option<MaskWire>,
    },
    DrawBlend {
        base: DrawBase,
        image: ImageWire,
        src_area: Rect,
        rop: u16,
        mask: Option<MaskWire>,
    },
    DrawTransparent {
        base: DrawBase,
        image: ImageWire,
        src_area: Rect,
        transparent_color: u32,
    },
    DrawAlphaBlend {
        base: DrawBase,
        image: ImageWire,
        src_area: Rect,
        alpha: u8,
    },
    CopyBits { base: DrawBase, src_pos: Point },
    DrawBlackness { base: DrawBase, mask: Option<MaskWire> },
    DrawWhiteness { base: DrawBase, mask: Option<MaskWire> },
    DrawInvers { base: DrawBase, mask: Option<MaskWire> },
    DrawRop3 {
        base: DrawBase,
        image: ImageWire,
        src_area: Rect,
        brush: BrushWire,
        rop3: u8,
        mask: Option<MaskWire>,
    },
    DrawStroke {
        base: DrawBase,
        segments: Vec<StrokeSegWire>,
        brush: BrushWire,
        fore_rop: u16,
    },
    DrawText {
        base: DrawBase,
        glyphs: Vec<GlyphWire>,
        fore: BrushWire,
        back: BrushWire,
        back_area: Rect,
    },
}

impl DisplayMsg {
    pub fn msg_type(&self) -> u16 {
        match self {
            DisplayMsg::SetAck { .. } => mt::SET_ACK,
            DisplayMsg::Migrate { .. } => mt::MIGRATE,
            DisplayMsg::MigrateData { .. } => mt::MIGRATE_DATA,
            DisplayMsg::WaitForChannels(_) => mt::WAIT_FOR_CHANNELS,
            DisplayMsg::Mark => mt::DISPLAY_MARK,
            DisplayMsg::Reset => mt::DISPLAY_RESET,
            DisplayMsg::InvalOne { .. } => mt::DISPLAY_INVAL_ONE,
            DisplayMsg::InvalAllPixmaps { .. } => mt::DISPLAY_INVAL_ALL_PIXMAPS,
            DisplayMsg::InvalPalette { .. } => mt::DISPLAY_INVAL_PALETTE,
            DisplayMsg::InvalAllPalettes => mt::DISPLAY_INVAL_ALL_PALETTES,
            DisplayMsg::SurfaceCreate { .. } => mt::DISPLAY_SURFACE_CREATE,
            DisplayMsg::SurfaceDestroy { .. } => mt::DISPLAY_SURFACE_DESTROY,
            DisplayMsg::StreamCreate { .. } => mt::DISPLAY_STREAM_CREATE,
            DisplayMsg::StreamData { .. } => mt::DISPLAY_STREAM_DATA,
            DisplayMsg::StreamClip { .. } => mt::DISPLAY_STREAM_CLIP,
            DisplayMsg::StreamDestroy { .. } => mt::DISPLAY_STREAM_DESTROY,
            DisplayMsg::StreamDestroyAll => mt::DISPLAY_STREAM_DESTROY_ALL,
            DisplayMsg::DrawFill { .. } => mt::DISPLAY_DRAW_FILL,
            DisplayMsg::DrawOpaque { .. } => mt::DISPLAY_DRAW_OPAQUE,
            DisplayMsg::DrawCopy { .. } => mt::DISPLAY_DRAW_COPY,
            DisplayMsg::DrawBlend { .. } => mt::DISPLAY_DRAW_BLEND,
            DisplayMsg::DrawTransparent { .. } => mt::DISPLAY_DRAW_TRANSPARENT,
            DisplayMsg::DrawAlphaBlend { .. } => mt::DISPLAY_DRAW_ALPHA_BLEND,
            DisplayMsg::CopyBits { .. } => mt::DISPLAY_COPY_BITS,
            DisplayMsg::DrawBlackness { .. } => mt::DISPLAY_DRAW_BLACKNESS,
            DisplayMsg::DrawWhiteness { .. } => mt::DISPLAY_DRAW_WHITENESS,
            DisplayMsg::DrawInvers { .. } => mt::DISPLAY_DRAW_INVERS,
            DisplayMsg::DrawRop3 { .. } => mt::DISPLAY_DRAW_ROP3,
            DisplayMsg::DrawStroke { .. } => mt::DISPLAY_DRAW_STROKE,
            DisplayMsg::DrawText { .. } => mt::DISPLAY_DRAW_TEXT,
        }
    }

    /// Marshal the body (headers are written by the sender).
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.marshal_into(&mut out).expect("vec write infallible");
        out
    }

    fn marshal_into<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            DisplayMsg::SetAck { generation, window } => {
                w.write_u32::<LittleEndian>(*generation)?;
                w.write_u32::<LittleEndian>(*window)
            }
            DisplayMsg::Migrate { flags } => w.write_u32::<LittleEndian>(*flags),
            DisplayMsg::MigrateData { data } => w.write_all(data),
            DisplayMsg::WaitForChannels(wait) => wait.marshal(w),
            DisplayMsg::Mark | DisplayMsg::Reset | DisplayMsg::InvalAllPalettes
            | DisplayMsg::StreamDestroyAll => Ok(()),
            DisplayMsg::InvalOne { id } | DisplayMsg::InvalPalette { id } => {
                w.write_u64::<LittleEndian>(*id)
            }
            DisplayMsg::InvalAllPixmaps { wait } => wait.marshal(w),
            DisplayMsg::SurfaceCreate {
                surface_id,
                width,
                height,
                format,
                primary,
            } => {
                w.write_u32::<LittleEndian>(*surface_id)?;
                w.write_u32::<LittleEndian>(*width)?;
                w.write_u32::<LittleEndian>(*height)?;
                w.write_u8(*format)?;
                w.write_u8(*primary as u8)
            }
            DisplayMsg::SurfaceDestroy { surface_id } => w.write_u32::<LittleEndian>(*surface_id),
            DisplayMsg::StreamCreate {
                id,
                flags,
                codec,
                dest,
                src_width,
                src_height,
                clip,
            } => {
                w.write_u32::<LittleEndian>(*id)?;
                w.write_u8(*flags)?;
                w.write_u8(*codec)?;
                put_rect(w, dest)?;
                w.write_u32::<LittleEndian>(*src_width)?;
                w.write_u32::<LittleEndian>(*src_height)?;
                clip.marshal(w)
            }
            DisplayMsg::StreamData { id, mm_time, data } => {
                w.write_u32::<LittleEndian>(*id)?;
                w.write_u32::<LittleEndian>(*mm_time)?;
                w.write_u32::<LittleEndian>(data.len() as u32)?;
                w.write_all(data)
            }
            DisplayMsg::StreamClip { id, clip } => {
                w.write_u32::<LittleEndian>(*id)?;
                clip.marshal(w)
            }
            DisplayMsg::StreamDestroy { id } => w.write_u32::<LittleEndian>(*id),
            DisplayMsg::DrawFill {
                base,
                brush,
                rop,
                mask,
            } => {
                base.marshal(w)?;
                brush.marshal(w)?;
                w.write_u16::<LittleEndian>(*rop)?;
                put_mask(w, mask)
            }
            DisplayMsg::DrawOpaque {
                base,
                image,
                src_area,
                brush,
                rop,
                mask,
            } => {
                base.marshal(w)?;
                image.marshal(w)?;
                put_rect(w, src_area)?;
                brush.marshal(w)?;
                w.write_u16::<LittleEndian>(*rop)?;
                put_mask(w, mask)
            }
            DisplayMsg::DrawCopy {
                base,
                image,
                src_area,
                rop,
                mask,
            }
            | DisplayMsg::DrawBlend {
                base,
                image,
                src_area,
                rop,
                mask,
            } => {
                base.marshal(w)?;
                image.marshal(w)?;
                put_rect(w, src_area)?;
                w.write_u16::<LittleEndian>(*rop)?;
                put_mask(w, mask)
            }
            DisplayMsg::DrawTransparent {
                base,
                image,
                src_area,
                transparent_color,
            } => {
                base.marshal(w)?;
                image.marshal(w)?;
                put_rect(w, src_area)?;
                w.write_u32::<LittleEndian>(*transparent_color)
            }
            DisplayMsg::DrawAlphaBlend {
                base,
                image,
                src_area,
                alpha,
            } => {
                base.marshal(w)?;
                image.marshal(w)?;
                put_rect(w, src_area)?;
                w.write_u8(*alpha)
            }
            DisplayMsg::CopyBits { base, src_pos } => {
                base.marshal(w)?;
                put_point(w, src_pos)
            }
            DisplayMsg::DrawBlackness { base, mask }
            | DisplayMsg::DrawWhiteness { base, mask }
            | DisplayMsg::DrawInvers { base, mask } => {
                base.marshal(w)?;
                put_mask(w, mask)
            }
            DisplayMsg::DrawRop3 {
                base,
                image,
                src_area,
                brush,
                rop3,
                mask,
            } => {
                base.marshal(w)?;
                image.marshal(w)?;
                put_rect(w, src_area)?;
                brush.marshal(w)?;
                w.write_u8(*rop3)?;
                put_mask(w, mask)
            }
            DisplayMsg::DrawStroke {
                base,
                segments,
                brush,
                fore_rop,
            } => {
                base.marshal(w)?;
                w.write_u32::<LittleEndian>(segments.len() as u32)?;
                for seg in segments {
                    w.write_u8(seg.closed as u8)?;
                    w.write_u32::<LittleEndian>(seg.points.len() as u32)?;
                    for p in &seg.points {
                        put_point(w, p)?;
                    }
                }
                brush.marshal(w)?;
                w.write_u16::<LittleEndian>(*fore_rop)
            }
            DisplayMsg::DrawText {
                base,
                glyphs,
                fore,
                back,
                back_area,
            } => {
                base.marshal(w)?;
                w.write_u16::<LittleEndian>(glyphs.len() as u16)?;
                for g in glyphs {
                    put_point(w, &g.render_pos)?;
                    w.write_u16::<LittleEndian>(g.width)?;
                    w.write_u16::<LittleEndian>(g.height)?;
                    w.write_u32::<LittleEndian>(g.data.len() as u32)?;
                    w.write_all(&g.data)?;
                }
                fore.marshal(w)?;
                back.marshal(w)?;
                put_rect(w, back_area)
            }
        }
    }
}

/// Cursor-channel messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorMsg {
    SetAck { generation: u32, window: u32 },
    Init {
        position: Point,
        visible: bool,
        trail_length: u16,
        trail_frequency: u16,
        shape: Option<CursorShapeWire>,
    },
    Reset,
    Set { position: Point, visible: bool, shape: CursorShapeWire },
    Move { position: Point },
    Hide,
    Trail { length: u16, frequency: u16 },
    InvalOne { id: u64 },
    InvalAll,
    Migrate { flags: u32 },
}

impl CursorMsg {
    pub fn msg_type(&self) -> u16 {
        match self {
            CursorMsg::SetAck { .. } => mt::SET_ACK,
            CursorMsg::Init { .. } => mt::CURSOR_INIT,
            CursorMsg::Reset => mt::CURSOR_RESET,
            CursorMsg::Set { .. } => mt::CURSOR_SET,
            CursorMsg::Move { .. } => mt::CURSOR_MOVE,
            CursorMsg::Hide => mt::CURSOR_HIDE,
            CursorMsg::Trail { .. } => mt::CURSOR_TRAIL,
            CursorMsg::InvalOne { .. } => mt::CURSOR_INVAL_ONE,
            CursorMsg::InvalAll => mt::CURSOR_INVAL_ALL,
            CursorMsg::Migrate { .. } => mt::MIGRATE,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.marshal_into(&mut out).expect("vec write infallible");
        out
    }

    fn marshal_into<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            CursorMsg::SetAck { generation, window } => {
                w.write_u32::<LittleEndian>(*generation)?;
                w.write_u32::<LittleEndian>(*window)
            }
            CursorMsg::Init {
                position,
                visible,
                trail_length,
                trail_frequency,
                shape,
            } => {
                put_point(w, position)?;
                w.write_u8(*visible as u8)?;
                w.write_u16::<LittleEndian>(*trail_length)?;
                w.write_u16::<LittleEndian>(*trail_frequency)?;
                match shape {
                    Some(s) => {
                        w.write_u8(1)?;
                        s.marshal(w)
                    }
                    None => w.write_u8(0),
                }
            }
            CursorMsg::Reset | CursorMsg::Hide | CursorMsg::InvalAll => Ok(()),
            CursorMsg::Set {
                position,
                visible,
                shape,
            } => {
                put_point(w, position)?;
                w.write_u8(*visible as u8)?;
                shape.marshal(w)
            }
            CursorMsg::Move { position } => put_point(w, position),
            CursorMsg::Trail { length, frequency } => {
                w.write_u16::<LittleEndian>(*length)?;
                w.write_u16::<LittleEndian>(*frequency)
            }
            CursorMsg::InvalOne { id } => w.write_u64::<LittleEndian>(*id),
            CursorMsg::Migrate { flags } => w.write_u32::<LittleEndian>(*flags),
        }
    }
}

/// Messages the server reads back from a display client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Start of a new ack generation.
    AckSync { generation: u32 },
    /// One window's worth of messages received.
    Ack,
    /// All channels flushed ahead of migration.
    MigrateFlushMark,
    MigrateData { data: Vec<u8> },
    Disconnecting,
    /// Cache wiring sent right after link: ids and budgets.
    DisplayInit {
        pixmap_cache_id: u64,
        pixmap_cache_size: u64,
        glz_dictionary_id: u64,
        glz_dictionary_window_size: u32,
    },
}

impl ClientMessage {
    pub fn msg_type(&self) -> u16 {
        match self {
            ClientMessage::AckSync { .. } => cmt::ACK_SYNC,
            ClientMessage::Ack => cmt::ACK,
            ClientMessage::MigrateFlushMark => cmt::MIGRATE_FLUSH_MARK,
            ClientMessage::MigrateData { .. } => cmt::MIGRATE_DATA,
            ClientMessage::Disconnecting => cmt::DISCONNECTING,
            ClientMessage::DisplayInit { .. } => cmt::DISPLAY_INIT,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ClientMessage::AckSync { generation } => {
                out.extend_from_slice(&generation.to_le_bytes());
            }
            ClientMessage::Ack | ClientMessage::MigrateFlushMark | ClientMessage::Disconnecting => {}
            ClientMessage::MigrateData { data } => out.extend_from_slice(data),
            ClientMessage::DisplayInit {
                pixmap_cache_id,
                pixmap_cache_size,
                glz_dictionary_id,
                glz_dictionary_window_size,
            } => {
                out.extend_from_slice(&pixmap_cache_id.to_le_bytes());
                out.extend_from_slice(&pixmap_cache_size.to_le_bytes());
                out.extend_from_slice(&glz_dictionary_id.to_le_bytes());
                out.extend_from_slice(&glz_dictionary_window_size.to_le_bytes());
            }
        }
        out
    }

    pub fn unmarshal(msg_type: u16, payload: &[u8]) -> Result<Self, WireError> {
        let mut r = payload;
        Ok(match msg_type {
            cmt::ACK_SYNC => ClientMessage::AckSync {
                generation: r.read_u32::<LittleEndian>()?,
            },
            cmt::ACK => ClientMessage::Ack,
            cmt::MIGRATE_FLUSH_MARK => ClientMessage::MigrateFlushMark,
            cmt::MIGRATE_DATA => ClientMessage::MigrateData {
                data: payload.to_vec(),
            },
            cmt::DISCONNECTING => ClientMessage::Disconnecting,
            cmt::DISPLAY_INIT => {
                let mut r = payload;
                ClientMessage::DisplayInit {
                    pixmap_cache_id: r.read_u64::<LittleEndian>()?,
                    pixmap_cache_size: r.read_u64::<LittleEndian>()?,
                    glz_dictionary_id: r.read_u64::<LittleEndian>()?,
                    glz_dictionary_window_size: r.read_u32::<LittleEndian>()?,
                }
            }
            other => return Err(WireError::UnknownMessage(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageData, ImageDescriptor, ImageFlags, ImageWireKind};

    #[test]
    fn draw_copy_marshals_with_image() {
        let msg = DisplayMsg::DrawCopy {
            base: DrawBase {
                surface_id: 0,
                bbox: Rect::new(10, 10, 74, 74),
                clip: ClipWire::None,
            },
            image: ImageWire {
                descriptor: ImageDescriptor {
                    id: 99,
                    kind: ImageWireKind::LzRgb,
                    flags: ImageFlags::CACHE_ME,
                    width: 64,
                    height: 64,
                },
                data: ImageData::Compressed {
                    data: vec![0xAB; 77],
                },
            },
            src_area: Rect::new(0, 0, 64, 64),
            rop: 0x0008,
            mask: None,
        };
        assert_eq!(msg.msg_type(), mt::DISPLAY_DRAW_COPY);
        let body = msg.marshal();
        // base (4 + 16 + 1) + descriptor (18) + len (4) + data (77) +
        // src_area (16) + rop (2) + mask flag (1)
        assert_eq!(body.len(), 21 + 18 + 4 + 77 + 16 + 2 + 1);
    }

    #[test]
    fn zero_payload_verbs() {
        assert!(DisplayMsg::Mark.marshal().is_empty());
        assert!(DisplayMsg::StreamDestroyAll.marshal().is_empty());
        assert!(DisplayMsg::InvalAllPalettes.marshal().is_empty());
        assert!(CursorMsg::Hide.marshal().is_empty());
    }

    #[test]
    fn client_messages_round_trip() {
        let cases = vec![
            ClientMessage::AckSync { generation: 7 },
            ClientMessage::Ack,
            ClientMessage::MigrateFlushMark,
            ClientMessage::MigrateData {
                data: vec![1, 2, 3],
            },
            ClientMessage::Disconnecting,
            ClientMessage::DisplayInit {
                pixmap_cache_id: 5,
                pixmap_cache_size: 1 << 20,
                glz_dictionary_id: 6,
                glz_dictionary_window_size: 1 << 16,
            },
        ];
        for msg in cases {
            let body = msg.marshal();
            let back = ClientMessage::unmarshal(msg.msg_type(), &body).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn unknown_client_message_rejected() {
        assert!(matches!(
            ClientMessage::unmarshal(999, &[]),
            Err(WireError::UnknownMessage(999))
        ));
    }

    #[test]
    fn stream_data_carries_mm_time() {
        let msg = DisplayMsg::StreamData {
            id: 0,
            mm_time: 123456,
            data: vec![0xFF, 0xD8, 0xFF],
        };
        let body = msg.marshal();
        assert_eq!(&body[..4], &0u32.to_le_bytes());
        assert_eq!(&body[4..8], &123456u32.to_le_bytes());
        assert_eq!(&body[8..12], &3u32.to_le_bytes());
    }
}
