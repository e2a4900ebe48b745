//! Build a single-volume UBI image from a raw binary.
//!
//! The image is a run of physical eraseblocks, each beginning with an erase counter header and a
//! volume ID header. No volume table is written, so the output is meant to be combined with other
//! volumes by a later step before it is flashed.

pub mod config;
pub mod generate;
pub mod ubi;
pub mod util;
