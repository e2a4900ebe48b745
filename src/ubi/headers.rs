//! This module contains the code necessary to read and write EC/VID headers, with CRC
//! verification/computation.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// The header format version written when the caller does not ask for a specific one
pub const UBI_VERSION: u8 = 1;

/// On-flash size of an EC header, in bytes
pub const UBI_EC_HDR_SIZE: u32 = 64;

/// On-flash size of a VID header, in bytes
pub const UBI_VID_HDR_SIZE: u32 = 64;

/// A trait missing from the `income` crate: implements parsing UBI headers from byteslices, with
/// magic and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];

    fn parse(buf: &'a [u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;

        if header.get_hdr_magic() != Self::get_magic() {
            return None;
        }

        if !header.check_crc() {
            return None;
        }

        Some(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
}

/// Another trait missing from `income` to compute the correct CRC for some Vid/Ec header
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> anyhow::Result<u32> {
        let header_bytes = self.to_bytes()?;
        let header_len = header_bytes.len() - std::mem::size_of::<u32>();
        Ok(UBI_CRC.checksum(&header_bytes[..header_len]))
    }

    fn check_crc(&self) -> bool {
        self.compute_crc().is_ok_and(|crc| crc == self.get_crc())
    }

    fn fix_crc(&mut self) -> anyhow::Result<()> {
        let crc = self.compute_crc()?;
        self.set_crc(crc);
        Ok(())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// Copy an encoded header into the front of `out_bytes`
fn copy_header(bytes: &[u8], out_bytes: &mut [u8]) -> anyhow::Result<()> {
    let out_bytes = out_bytes
        .get_mut(..bytes.len())
        .ok_or(anyhow::anyhow!("out_bytes too small"))?;
    out_bytes.copy_from_slice(bytes);
    Ok(())
}

/// This represents the specific fields we care about in an EC header
///
/// This is meant to be more ergonomic to work with than EcHdr, which represents the raw data
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub version: u8,
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        EcHdr::parse(bytes).map(|x| x.into())
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = EcHdr::try_from(self)?.to_bytes()?;
        copy_header(&bytes, out_bytes)
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            version,
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            version,
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl TryFrom<Ec> for EcHdr {
    type Error = anyhow::Error;

    fn try_from(value: Ec) -> anyhow::Result<EcHdr> {
        let Ec {
            version,
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut target = Self {
            magic: UBI_EC_HDR_MAGIC.try_into()?,
            version,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc()?;
        Ok(target)
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// This represents the specific fields we care about in a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The header format version.
    pub version: u8,

    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving `vol_id:lnum`
    /// collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Change the sequence number for this `Vid`
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        VidHdr::parse(bytes).and_then(|x| x.try_into().ok())
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = VidHdr::try_from(self)?.to_bytes()?;
        copy_header(&bytes, out_bytes)
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = ();

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            version,
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            version,
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl TryFrom<Vid> for VidHdr {
    type Error = anyhow::Error;

    fn try_from(value: Vid) -> anyhow::Result<VidHdr> {
        let Vid {
            version,
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let vol_type = vol_type.into();
        let copy_flag = copy_flag.into();

        let mut target = Self {
            magic: UBI_VID_HDR_MAGIC.try_into()?,
            version,

            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc()?;
        Ok(target)
    }
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let ec = Ec {
        version: UBI_VERSION,
        ec: 42,
        vid_hdr_offset: 2048,
        data_offset: 4096,
        image_seq: 0,
    };
    let vid = Vid {
        version: UBI_VERSION,
        vol_type: VolType::Static,
        vol_id: 3,
        lnum: 1,
        data_size: 100,
        used_ebs: 2,
        data_crc: 0xdeadbeef,
        sqnum: 9,
        ..Default::default()
    };

    let mut buf = vec![0u8; 1024];

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf), Some(ec));
    assert_eq!(Vid::decode(&buf), None);

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf), Some(vid));
    assert_eq!(Ec::decode(&buf), None);

    Ok(())
}

#[test]
fn test_header_sizes() -> anyhow::Result<()> {
    let ec = EcHdr::try_from(Ec::default())?.to_bytes()?;
    let vid = VidHdr::try_from(Vid::default())?.to_bytes()?;
    assert_eq!(ec.len(), UBI_EC_HDR_SIZE as usize);
    assert_eq!(vid.len(), UBI_VID_HDR_SIZE as usize);
    Ok(())
}

#[test]
fn test_corrupt_header() -> anyhow::Result<()> {
    let mut buf = vec![0u8; 64];
    Ec::default().encode(&mut buf)?;
    buf[12] ^= 0x01;
    assert_eq!(Ec::decode(&buf), None);

    let mut short = [0u8; 16];
    assert!(Ec::default().encode(&mut short).is_err());
    Ok(())
}
