//! Driving the image generator over a resolved configuration.

use crate::config::{FlashGeometry, InputSource, VolumeSpec};
use crate::ubi::{EngineError, ImageGenerator, ImageParams, VolType};

use std::io::Write;

use thiserror::Error;

/// How much data the input holds, as far as can be told before reading it
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataLength {
    Known(u64),

    /// The input is a pipe, a character device, or otherwise has no length up front
    Unknown,
}

impl DataLength {
    /// The length to declare in headers; unknown lengths are declared as 0
    pub fn declared(self) -> u64 {
        match self {
            DataLength::Known(len) => len,
            DataLength::Unknown => 0,
        }
    }
}

impl InputSource {
    /// Find the length of the input, if it is a regular file.
    pub fn probe_length(&self) -> DataLength {
        match self {
            InputSource::File(file) => match file.metadata() {
                Ok(meta) if meta.is_file() => DataLength::Known(meta.len()),
                Ok(_) => DataLength::Unknown,
                Err(error) => {
                    log::debug!("cannot fetch input size: {error}");
                    DataLength::Unknown
                }
            },
            InputSource::Stream(_) => DataLength::Unknown,
        }
    }
}

/// Which phase of generation failed
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("cannot create UBI image generator (err {})", .0.code())]
    CreateFailed(#[source] EngineError),

    #[error("cannot convert input data (err {})", .0.code())]
    WriteFailed(#[source] EngineError),

    #[error("cannot release UBI image generator (err {})", .0.code())]
    DestroyFailed(#[source] EngineError),
}

impl GenerationError {
    /// The engine's code for the failure
    pub fn code(&self) -> i32 {
        match self {
            GenerationError::CreateFailed(x)
            | GenerationError::WriteFailed(x)
            | GenerationError::DestroyFailed(x) => x.code(),
        }
    }
}

/// Build the engine's parameters from the resolved configuration and the probed input length
pub fn image_params(
    geometry: &FlashGeometry,
    volume: &VolumeSpec,
    data_len: DataLength,
) -> ImageParams {
    ImageParams {
        vol_id: volume.id,
        vol_type: volume.vol_type,
        peb_size: geometry.peb_size,
        min_io_size: geometry.min_io_size,
        sub_page_size: geometry.sub_page_size,
        ec: volume.erase_counter,
        alignment: volume.alignment,
        version: volume.format_version,
        vid_hdr_offset: geometry.vid_hdr_offset,
        compat: 0,
        data_len: data_len.declared(),
    }
}

/// Write a complete single-volume image of `input` to `output`.
///
/// The generator is always released once created, and the first failure is the one reported.
pub fn generate<W: Write>(
    geometry: FlashGeometry,
    volume: VolumeSpec,
    input: InputSource,
    output: W,
) -> Result<(), GenerationError> {
    let data_len = input.probe_length();
    if volume.vol_type == VolType::Static && data_len == DataLength::Unknown {
        log::warn!(
            "input length is unknown; the static volume will be declared with zero size, which \
             readers cannot tell apart from a genuinely empty volume"
        );
    }

    let params = image_params(&geometry, &volume, data_len);
    let mut generator =
        ImageGenerator::create(params, input, output).map_err(GenerationError::CreateFailed)?;

    let written = generator
        .write_complete()
        .map(|_| ())
        .map_err(GenerationError::WriteFailed);
    let released = generator
        .destroy()
        .map_err(GenerationError::DestroyFailed);

    written.and(released)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::ubi::{Ec, Vid};

    use std::io::{self, Read};
    use std::num::NonZeroU32;

    fn nz(x: u32) -> NonZeroU32 {
        NonZeroU32::new(x).unwrap()
    }

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            peb_size: nz(128 * 1024),
            min_io_size: nz(2048),
            sub_page_size: nz(2048),
            vid_hdr_offset: 0,
        }
    }

    fn volume(vol_type: VolType) -> VolumeSpec {
        VolumeSpec {
            id: 0,
            vol_type,
            alignment: nz(1),
            erase_counter: 3,
            format_version: 0,
        }
    }

    /// A reader that hands out its data a few bytes at a time, like a pipe
    struct Trickle(Vec<u8>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.0.len()).min(7);
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0.drain(..n);
            Ok(n)
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk on fire"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("still on fire"))
        }
    }

    #[test]
    fn test_probe_file() -> anyhow::Result<()> {
        let mut file = tempfile::tempfile()?;
        io::Write::write_all(&mut file, &[0u8; 100])?;
        assert_eq!(
            InputSource::File(file).probe_length(),
            DataLength::Known(100)
        );

        let stream = InputSource::Stream(Box::new(io::empty()));
        assert_eq!(stream.probe_length(), DataLength::Unknown);
        Ok(())
    }

    #[test]
    fn test_generate_dynamic() -> anyhow::Result<()> {
        let mut file = tempfile::tempfile()?;
        io::Write::write_all(&mut file, &[0x42u8; 100])?;
        io::Seek::rewind(&mut file)?;

        let mut image = Vec::new();
        generate(
            geometry(),
            volume(VolType::Dynamic),
            InputSource::File(file),
            &mut image,
        )?;

        assert_eq!(image.len(), 128 * 1024);
        assert_eq!(Ec::decode(&image).map(|x| x.ec), Some(3));
        assert_eq!(Vid::decode(&image[2048..]).map(|x| x.vol_id), Some(0));
        assert_eq!(&image[4096..4196], &[0x42u8; 100][..]);
        Ok(())
    }

    #[test]
    fn test_generate_static_from_stream() -> anyhow::Result<()> {
        let input = InputSource::Stream(Box::new(Trickle(vec![0x99; 130_000])));

        let mut image = Vec::new();
        generate(geometry(), volume(VolType::Static), input, &mut image)?;

        // 130000 bytes over 126976-byte LEBs, declared with zero size
        assert_eq!(image.len(), 2 * 128 * 1024);
        let vid = Vid::decode(&image[128 * 1024 + 2048..]).unwrap();
        assert_eq!(vid.lnum, 1);
        assert_eq!(vid.used_ebs, 0);
        assert_eq!(vid.data_size, 130_000 - 126_976);
        Ok(())
    }

    #[test]
    fn test_create_failure_writes_nothing() {
        let geometry = FlashGeometry {
            sub_page_size: nz(4096),
            ..geometry()
        };
        let input = InputSource::Stream(Box::new(io::empty()));

        let mut image = Vec::new();
        let error = generate(geometry, volume(VolType::Dynamic), input, &mut image).unwrap_err();
        assert!(matches!(error, GenerationError::CreateFailed(_)));
        assert_eq!(error.code(), -22);
        assert!(image.is_empty());
    }

    #[test]
    fn test_write_failure_reported_first() {
        let input = InputSource::Stream(Box::new(Trickle(vec![1; 10])));

        // Both the write and the release fail; the write is what gets reported
        let error = generate(geometry(), volume(VolType::Dynamic), input, Broken).unwrap_err();
        assert!(matches!(error, GenerationError::WriteFailed(_)));
        assert_eq!(error.code(), -5);
    }

    #[test]
    fn test_image_params() {
        let params = image_params(
            &geometry(),
            &volume(VolType::Static),
            DataLength::Known(5000),
        );
        assert_eq!(params.data_len, 5000);
        assert_eq!(params.compat, 0);
        assert_eq!(params.ec, 3);

        let params = image_params(&geometry(), &volume(VolType::Static), DataLength::Unknown);
        assert_eq!(params.data_len, 0);
    }
}
