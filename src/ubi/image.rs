//! This module implements the image-generation engine.
//!
//! An [ImageGenerator] is bound to one volume, one input stream and one output stream. The input
//! is consumed one LEB at a time, and each LEB is emitted as a complete PEB (headers, data and
//! 0xFF padding), so the output is always a whole number of PEBs and the input never has to fit
//! in memory.

use super::headers::{Ec, Vid, VolType, UBI_CRC, UBI_EC_HDR_SIZE, UBI_VERSION, UBI_VID_HDR_SIZE};
use crate::util::ReadExt;

use std::io::{self, Read, Write};
use std::num::NonZeroU32;

use thiserror::Error;

/// The number of user volumes UBI supports
const UBI_MAX_VOLUMES: u32 = 128;

/// VID headers must start on a multiple of this many bytes
const UBI_VID_HDR_ALIGN: u32 = 8;

const EIO: i32 = 5;
const EINVAL: i32 = 22;

/// Ways the engine can reject its parameters or fail to produce an image
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{what} {value} is not a power of 2")]
    NotPowerOfTwo { what: &'static str, value: u32 },

    #[error("sub-page size {sub_page_size} is larger than the min. I/O unit size {min_io_size}")]
    SubPageTooLarge { sub_page_size: u32, min_io_size: u32 },

    #[error("PEB size {peb_size} is not a multiple of the min. I/O unit size {min_io_size}")]
    UnalignedPeb { peb_size: u32, min_io_size: u32 },

    #[error("bad VID header offset {offset}: {reason}")]
    BadVidHdrOffset { offset: u32, reason: &'static str },

    #[error("data offset {data_offset} leaves no room for data in a {peb_size}-byte PEB")]
    NoRoomForData { data_offset: u64, peb_size: u32 },

    #[error("bad volume alignment {alignment}: {reason}")]
    BadAlignment {
        alignment: u32,
        reason: &'static str,
    },

    #[error("UBI version {0} does not fit in a header")]
    BadVersion(u32),

    #[error("volume ID {0} is out of range (must be below 128)")]
    BadVolId(u32),

    #[error("static volume of {0} bytes needs too many eraseblocks")]
    TooLarge(u64),

    #[error("cannot encode UBI header")]
    Encode(#[source] anyhow::Error),

    #[error("cannot read input")]
    Read(#[source] io::Error),

    #[error("cannot write output")]
    Write(#[source] io::Error),

    #[error("image generator was already released")]
    Released,
}

impl EngineError {
    /// A negative errno-style code summarizing this error
    pub fn code(&self) -> i32 {
        match self {
            EngineError::Read(_) | EngineError::Write(_) => -EIO,
            _ => -EINVAL,
        }
    }
}

/// Everything the engine needs to know about the volume and the flash it's destined for
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageParams {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub peb_size: NonZeroU32,
    pub min_io_size: NonZeroU32,
    pub sub_page_size: NonZeroU32,

    /// Erase counter written to every EC header
    pub ec: u64,

    pub alignment: NonZeroU32,

    /// Header format version; 0 selects [UBI_VERSION]
    pub version: u32,

    /// Offset of the VID header within the PEB; 0 selects a default based on the sub-page size
    pub vid_hdr_offset: u32,

    /// Compatibility flags for the VID header; only internal volumes use these
    pub compat: u8,

    /// Length of the input in bytes, if known, else 0. Only `Static` volumes depend on it.
    pub data_len: u64,
}

/// Where everything goes within each PEB
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageLayout {
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub leb_size: NonZeroU32,
    pub data_pad: u32,
    pub version: u8,

    /// The number of LEBs declared in every VID header; always 0 for `Dynamic` volumes
    pub used_ebs: u32,
}

fn round_up(value: u64, to: NonZeroU32) -> u64 {
    let to = u64::from(to.get());
    value.div_ceil(to) * to
}

impl ImageLayout {
    /// Validate the parameters and compute the layout of each PEB.
    pub fn compute(params: &ImageParams) -> Result<Self, EngineError> {
        use EngineError::*;

        let peb_size = params.peb_size.get();
        let min_io_size = params.min_io_size.get();
        let sub_page_size = params.sub_page_size.get();

        if !min_io_size.is_power_of_two() {
            return Err(NotPowerOfTwo {
                what: "min. I/O unit size",
                value: min_io_size,
            });
        }
        if !sub_page_size.is_power_of_two() {
            return Err(NotPowerOfTwo {
                what: "sub-page size",
                value: sub_page_size,
            });
        }
        if sub_page_size > min_io_size {
            return Err(SubPageTooLarge {
                sub_page_size,
                min_io_size,
            });
        }
        if peb_size % min_io_size != 0 {
            return Err(UnalignedPeb {
                peb_size,
                min_io_size,
            });
        }

        // The EC header is written in the first sub-page; the VID header follows in the next one,
        // unless told otherwise.
        let vid_hdr_offset = match params.vid_hdr_offset {
            0 => round_up(UBI_EC_HDR_SIZE.into(), params.sub_page_size),
            offset if offset % UBI_VID_HDR_ALIGN != 0 => {
                return Err(BadVidHdrOffset {
                    offset,
                    reason: "must be a multiple of 8",
                })
            }
            offset if offset < UBI_EC_HDR_SIZE => {
                return Err(BadVidHdrOffset {
                    offset,
                    reason: "overlaps the EC header",
                })
            }
            offset => offset.into(),
        };

        let data_offset = round_up(
            vid_hdr_offset + u64::from(UBI_VID_HDR_SIZE),
            params.min_io_size,
        );
        if data_offset >= u64::from(peb_size) {
            return Err(NoRoomForData {
                data_offset,
                peb_size,
            });
        }

        // Both offsets are below `peb_size` from here on
        let vid_hdr_offset = vid_hdr_offset as u32;
        let data_offset = data_offset as u32;
        let raw_leb_size = peb_size - data_offset;

        let alignment = params.alignment.get();
        if alignment != 1 && alignment % min_io_size != 0 {
            return Err(BadAlignment {
                alignment,
                reason: "must be 1 or a multiple of the min. I/O unit size",
            });
        }
        if alignment > raw_leb_size {
            return Err(BadAlignment {
                alignment,
                reason: "larger than the LEB size",
            });
        }
        let data_pad = raw_leb_size % alignment;
        let leb_size = NonZeroU32::new(raw_leb_size - data_pad)
            .ok_or(BadAlignment {
                alignment,
                reason: "larger than the LEB size",
            })?;

        let version = match params.version {
            0 => UBI_VERSION,
            x => u8::try_from(x).map_err(|_| BadVersion(x))?,
        };

        if params.vol_id >= UBI_MAX_VOLUMES {
            return Err(BadVolId(params.vol_id));
        }

        let used_ebs = match params.vol_type {
            VolType::Dynamic => 0,
            VolType::Static => {
                let ebs = params.data_len.div_ceil(u64::from(leb_size.get()));
                u32::try_from(ebs).map_err(|_| TooLarge(params.data_len))?
            }
        };

        Ok(Self {
            vid_hdr_offset,
            data_offset,
            leb_size,
            data_pad,
            version,
            used_ebs,
        })
    }
}

/// The state held between `create` and `destroy`
struct Context<R: Read, W: Write> {
    params: ImageParams,
    layout: ImageLayout,
    input: R,
    output: W,
    sqnum: u64,
}

impl<R: Read, W: Write> Context<R, W> {
    fn write_complete(&mut self) -> Result<u32, EngineError> {
        let Self {
            params,
            layout,
            input,
            output,
            sqnum,
        } = self;

        let peb_size = params.peb_size.get() as usize;
        let leb_size = layout.leb_size.get() as usize;
        let data_offset = layout.data_offset as usize;
        let vid_hdr_offset = layout.vid_hdr_offset as usize;

        let ec = Ec {
            version: layout.version,
            ec: params.ec,
            vid_hdr_offset: layout.vid_hdr_offset,
            data_offset: layout.data_offset,
            image_seq: 0,
        };

        let vid_proto = Vid {
            version: layout.version,
            vol_type: params.vol_type,
            copy_flag: false,
            compat: params.compat,
            vol_id: params.vol_id,
            used_ebs: layout.used_ebs,
            data_pad: layout.data_pad,
            ..Default::default()
        };

        // A static volume never holds more than it declares; without a declared size, it takes
        // whatever the input has.
        let limit = match (params.vol_type, params.data_len) {
            (VolType::Static, len) if len > 0 => len,
            _ => u64::MAX,
        };
        let mut input = input.take(limit);

        let estimate = params
            .data_len
            .div_ceil(u64::from(layout.leb_size.get()))
            .max(1);
        let rpt = howudoin::new()
            .label("Writing eraseblocks")
            .set_len(estimate);

        let mut peb = Vec::with_capacity(peb_size);
        let mut lnum = 0u32;
        loop {
            // Headers and the gap between them are written over a freshly "erased" region
            peb.clear();
            peb.resize(data_offset, 0xFFu8);
            input
                .read_to_vec(&mut peb, leb_size)
                .map_err(EngineError::Read)?;
            let data_len = peb.len() - data_offset;

            // An empty input still gets one PEB, so that the volume is represented in the image
            if data_len == 0 && lnum > 0 {
                break;
            }

            let mut vid = Vid { lnum, ..vid_proto };
            if params.vol_type == VolType::Static {
                vid.data_size = data_len as u32;
                vid.data_crc = UBI_CRC.checksum(&peb[data_offset..]);
            }
            *sqnum += 1;
            let vid = vid.sqnum(*sqnum);

            ec.encode(&mut peb[..]).map_err(EngineError::Encode)?;
            vid.encode(&mut peb[vid_hdr_offset..])
                .map_err(EngineError::Encode)?;
            peb.resize(peb_size, 0xFFu8);

            output.write_all(&peb).map_err(EngineError::Write)?;
            lnum += 1;
            rpt.inc();

            // A short LEB means the input hit EOF
            if data_len < leb_size {
                break;
            }
        }

        rpt.close();
        Ok(lnum)
    }

    fn destroy(mut self) -> Result<(), EngineError> {
        self.output.flush().map_err(EngineError::Write)
    }
}

/// A handle to a single image being generated.
///
/// The context is released exactly once: by [ImageGenerator::destroy] if the caller wants to see
/// the outcome, otherwise when the handle is dropped.
pub struct ImageGenerator<R: Read, W: Write> {
    context: Option<Context<R, W>>,
}

impl<R: Read, W: Write> ImageGenerator<R, W> {
    /// Validate `params` and bind a new generator to the given streams.
    ///
    /// Nothing is read or written until [ImageGenerator::write_complete] is called.
    pub fn create(params: ImageParams, input: R, output: W) -> Result<Self, EngineError> {
        let layout = ImageLayout::compute(&params)?;
        log::debug!(
            "UBI layout: VID header at {}, data at {}, LEB size {}, data pad {}, version {}",
            layout.vid_hdr_offset,
            layout.data_offset,
            layout.leb_size,
            layout.data_pad,
            layout.version,
        );

        Ok(Self {
            context: Some(Context {
                params,
                layout,
                input,
                output,
                sqnum: 0,
            }),
        })
    }

    /// The computed layout, until the context is released
    pub fn layout(&self) -> Option<&ImageLayout> {
        self.context.as_ref().map(|x| &x.layout)
    }

    /// Consume the entire input, writing out the complete image.
    ///
    /// Returns the number of PEBs written.
    pub fn write_complete(&mut self) -> Result<u32, EngineError> {
        let context = self.context.as_mut().ok_or(EngineError::Released)?;
        let pebs = context.write_complete()?;
        log::info!("wrote {pebs} eraseblock(s)");
        Ok(pebs)
    }

    /// Release the context, flushing the output.
    pub fn destroy(mut self) -> Result<(), EngineError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), EngineError> {
        match self.context.take() {
            Some(context) => context.destroy(),
            None => Ok(()),
        }
    }
}

impl<R: Read, W: Write> Drop for ImageGenerator<R, W> {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            log::warn!("failed to release UBI image generator: {error}");
        }
    }
}
