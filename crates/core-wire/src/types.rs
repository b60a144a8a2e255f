//! Wire primitives: rects, clips, image descriptors and payloads.

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core_region::{Point, Rect};
use std::io::{self, Read, Write};

use crate::WireError;

pub fn put_rect<W: Write>(w: &mut W, r: &Rect) -> io::Result<()> {
    w.write_i32::<LittleEndian>(r.top)?;
    w.write_i32::<LittleEndian>(r.left)?;
    w.write_i32::<LittleEndian>(r.bottom)?;
    w.write_i32::<LittleEndian>(r.right)
}

pub fn get_rect<R: Read>(r: &mut R) -> Result<Rect, WireError> {
    let top = r.read_i32::<LittleEndian>()?;
    let left = r.read_i32::<LittleEndian>()?;
    let bottom = r.read_i32::<LittleEndian>()?;
    let right = r.read_i32::<LittleEndian>()?;
    Ok(Rect {
        left,
        top,
        right,
        bottom,
    })
}

pub fn put_point<W: Write>(w: &mut W, p: &Point) -> io::Result<()> {
    w.write_i32::<LittleEndian>(p.x)?;
    w.write_i32::<LittleEndian>(p.y)
}

pub fn get_point<R: Read>(r: &mut R) -> Result<Point, WireError> {
    let x = r.read_i32::<LittleEndian>()?;
    let y = r.read_i32::<LittleEndian>()?;
    Ok(Point { x, y })
}

/// Clip as transmitted: none, or a rect list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipWire {
    None,
    Rects(Vec<Rect>),
}

impl ClipWire {
    pub fn marshal<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            ClipWire::None => w.write_u8(0),
            ClipWire::Rects(rects) => {
                w.write_u8(1)?;
                w.write_u32::<LittleEndian>(rects.len() as u32)?;
                for r in rects {
                    put_rect(w, r)?;
                }
                Ok(())
            }
        }
    }

    pub fn unmarshal<R: Read>(r: &mut R) -> Result<Self, WireError> {
        match r.read_u8()? {
            0 => Ok(ClipWire::None),
            1 => {
                let n = r.read_u32::<LittleEndian>()?;
                let mut rects = Vec::with_capacity(n.min(4096) as usize);
                for _ in 0..n {
                    rects.push(get_rect(r)?);
                }
                Ok(ClipWire::Rects(rects))
            }
            other => Err(WireError::BadEnum(other as u32)),
        }
    }
}

/// How the image payload is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageWireKind {
    Bitmap = 0,
    Quic = 1,
    LzRgb = 2,
    LzPalette = 3,
    GlzRgb = 4,
    ZlibGlzRgb = 5,
    Jpeg = 6,
    JpegAlpha = 7,
    Surface = 8,
    FromCache = 9,
    FromCacheLossless = 10,
}

impl TryFrom<u8> for ImageWireKind {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => Self::Bitmap,
            1 => Self::Quic,
            2 => Self::LzRgb,
            3 => Self::LzPalette,
            4 => Self::GlzRgb,
            5 => Self::ZlibGlzRgb,
            6 => Self::Jpeg,
            7 => Self::JpegAlpha,
            8 => Self::Surface,
            9 => Self::FromCache,
            10 => Self::FromCacheLossless,
            other => return Err(WireError::UnknownImageKind(other)),
        })
    }
}

bitflags! {
    /// Image descriptor flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageFlags: u8 {
        /// Client should insert this image into its pixmap cache.
        const CACHE_ME = 0x01;
        /// Replace an existing (lossy) cache entry under the same id.
        const CACHE_REPLACE_ME = 0x02;
    }
}

/// Leading descriptor of every image-carrying payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub id: u64,
    pub kind: ImageWireKind,
    pub flags: ImageFlags,
    pub width: u32,
    pub height: u32,
}

impl ImageDescriptor {
    pub fn marshal<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.id)?;
        w.write_u8(self.kind as u8)?;
        w.write_u8(self.flags.bits())?;
        w.write_u32::<LittleEndian>(self.width)?;
        w.write_u32::<LittleEndian>(self.height)
    }

    pub fn unmarshal<R: Read>(r: &mut R) -> Result<Self, WireError> {
        let id = r.read_u64::<LittleEndian>()?;
        let kind = ImageWireKind::try_from(r.read_u8()?)?;
        let flags = ImageFlags::from_bits_truncate(r.read_u8()?);
        let width = r.read_u32::<LittleEndian>()?;
        let height = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            id,
            kind,
            flags,
            width,
            height,
        })
    }
}

/// The payload that follows a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageData {
    /// Uncompressed rows, plus format byte, stride and optional palette.
    Bitmap {
        format: u8,
        stride: u32,
        top_down: bool,
        palette: Option<Vec<u32>>,
        data: Vec<u8>,
    },
    /// Any single-chain compressed method (quic, lz-rgb, glz, zlib-glz,
    /// jpeg). The kind in the descriptor disambiguates.
    Compressed { data: Vec<u8> },
    /// lz-plt: palette reference (or inline) plus compressed indices.
    LzPalette {
        palette_id: u64,
        palette: Option<Vec<u32>>,
        data: Vec<u8>,
    },
    /// jpeg-alpha: split offset of the LZ alpha tail inside `data`.
    JpegAlpha { jpeg_size: u32, data: Vec<u8> },
    /// Reference to another surface.
    Surface { surface_id: u32 },
    /// Cache reference: no payload beyond the descriptor.
    None,
}

/// Descriptor + data, the unit embedded in draw messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageWire {
    pub descriptor: ImageDescriptor,
    pub data: ImageData,
}

impl ImageWire {
    pub fn marshal<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.descriptor.marshal(w)?;
        match &self.data {
            ImageData::Bitmap {
                format,
                stride,
                top_down,
                palette,
                data,
            } => {
                w.write_u8(*format)?;
                w.write_u32::<LittleEndian>(*stride)?;
                w.write_u8(*top_down as u8)?;
                match palette {
                    Some(entries) => {
                        w.write_u16::<LittleEndian>(entries.len() as u16)?;
                        for e in entries {
                            w.write_u32::<LittleEndian>(*e)?;
                        }
                    }
                    None => w.write_u16::<LittleEndian>(0)?,
                }
                w.write_u32::<LittleEndian>(data.len() as u32)?;
                w.write_all(data)
            }
            ImageData::Compressed { data } => {
                w.write_u32::<LittleEndian>(data.len() as u32)?;
                w.write_all(data)
            }
            ImageData::LzPalette {
                palette_id,
                palette,
                data,
            } => {
                w.write_u64::<LittleEndian>(*palette_id)?;
                match palette {
                    Some(entries) => {
                        w.write_u16::<LittleEndian>(entries.len() as u16)?;
                        for e in entries {
                            w.write_u32::<LittleEndian>(*e)?;
                        }
                    }
                    None => w.write_u16::<LittleEndian>(0)?,
                }
                w.write_u32::<LittleEndian>(data.len() as u32)?;
                w.write_all(data)
            }
            ImageData::JpegAlpha { jpeg_size, data } => {
                w.write_u32::<LittleEndian>(*jpeg_size)?;
                w.write_u32::<LittleEndian>(data.len() as u32)?;
                w.write_all(data)
            }
            ImageData::Surface { surface_id } => w.write_u32::<LittleEndian>(*surface_id),
            ImageData::None => Ok(()),
        }
    }

    pub fn unmarshal<R: Read>(r: &mut R) -> Result<Self, WireError> {
        let descriptor = ImageDescriptor::unmarshal(r)?;
        let data = match descriptor.kind {
            ImageWireKind::Bitmap => {
                let format = r.read_u8()?;
                let stride = r.read_u32::<LittleEndian>()?;
                let top_down = r.read_u8()? != 0;
                let n = r.read_u16::<LittleEndian>()?;
                let palette = if n > 0 {
                    let mut entries = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        entries.push(r.read_u32::<LittleEndian>()?);
                    }
                    Some(entries)
                } else {
                    None
                };
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut data = vec![0; len];
                r.read_exact(&mut data)?;
                ImageData::Bitmap {
                    format,
                    stride,
                    top_down,
                    palette,
                    data,
                }
            }
            ImageWireKind::Quic
            | ImageWireKind::LzRgb
            | ImageWireKind::GlzRgb
            | ImageWireKind::ZlibGlzRgb
            | ImageWireKind::Jpeg => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut data = vec![0; len];
                r.read_exact(&mut data)?;
                ImageData::Compressed { data }
            }
            ImageWireKind::LzPalette => {
                let palette_id = r.read_u64::<LittleEndian>()?;
                let n = r.read_u16::<LittleEndian>()?;
                let palette = if n > 0 {
                    let mut entries = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        entries.push(r.read_u32::<LittleEndian>()?);
                    }
                    Some(entries)
                } else {
                    None
                };
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut data = vec![0; len];
                r.read_exact(&mut data)?;
                ImageData::LzPalette {
                    palette_id,
                    palette,
                    data,
                }
            }
            ImageWireKind::JpegAlpha => {
                let jpeg_size = r.read_u32::<LittleEndian>()?;
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut data = vec![0; len];
                r.read_exact(&mut data)?;
                ImageData::JpegAlpha { jpeg_size, data }
            }
            ImageWireKind::Surface => ImageData::Surface {
                surface_id: r.read_u32::<LittleEndian>()?,
            },
            ImageWireKind::FromCache | ImageWireKind::FromCacheLossless => ImageData::None,
        };
        Ok(Self { descriptor, data })
    }
}

/// Wait instruction: the client must not process further messages on this
/// channel until each named channel has reached the given serial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireWaitForChannels {
    pub wait_list: Vec<(u8, u8, u64)>, // (channel_type, channel_id, serial)
}

impl WireWaitForChannels {
    pub fn marshal<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.wait_list.len() as u8)?;
        for (ty, id, serial) in &self.wait_list {
            w.write_u8(*ty)?;
            w.write_u8(*id)?;
            w.write_u64::<LittleEndian>(*serial)?;
        }
        Ok(())
    }

    pub fn unmarshal<R: Read>(r: &mut R) -> Result<Self, WireError> {
        let n = r.read_u8()?;
        let mut wait_list = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let ty = r.read_u8()?;
            let id = r.read_u8()?;
            let serial = r.read_u64::<LittleEndian>()?;
            wait_list.push((ty, id, serial));
        }
        Ok(Self { wait_list })
    }
}
