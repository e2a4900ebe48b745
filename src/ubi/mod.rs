//! This module implements the UBI side of image generation: the on-flash headers, and the engine
//! that lays a single volume out across physical eraseblocks.
//!
//! UBI populates the start of every physical eraseblock ("PEB") with an "erase counter" ("EC")
//! header, and if the block is in use, a "volume ID" ("VID") header at a fixed offset after it:
//!
//! ```text
//! +---------------------------- PEB ----------------------------+
//! | EC hdr | 0xFF... | VID hdr | 0xFF... | LEB data ... | pad    |
//! +-------------------------------------------------------------+
//! 0        64        vid_hdr_offset      data_offset            peb_size
//! ```
//!
//! The remainder of the PEB, from `data_offset` onward, is the logical eraseblock ("LEB"). If the
//! volume has an alignment requirement, the end of each LEB is trimmed (`data_pad`) so that the
//! usable size is a multiple of the alignment.

mod headers;
mod image;

pub use headers::{Ec, Vid, VolType, UBI_CRC, UBI_EC_HDR_SIZE, UBI_VERSION, UBI_VID_HDR_SIZE};
pub use image::{EngineError, ImageGenerator, ImageLayout, ImageParams};
