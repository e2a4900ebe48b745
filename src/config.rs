//! Turning command-line options into a validated flash geometry and volume description.
//!
//! Every option arrives as raw text; [resolve] parses it, applies the defaults, and opens the
//! input and output streams. Nothing here is mutated after [resolve] returns.

use crate::ubi::VolType;
use crate::util::{parse_int, parse_size, SizeError};

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use clap::Parser;
use thiserror::Error;

// The options, exactly as the user typed them
#[derive(Parser, Debug, Default, Clone)]
#[clap(author, version, about, long_about = LONG_ABOUT)]
pub struct RawOptions {
    /// The input file
    #[clap(short = 'i', long = "infile", value_name = "FILENAME")]
    pub infile: Option<PathBuf>,

    /// The output file (default is stdout)
    #[clap(short = 'o', long = "outfile", value_name = "FILENAME")]
    pub outfile: Option<PathBuf>,

    /// Size of the physical eraseblock of the flash this UBI image is created for, in bytes,
    /// KiB, MiB or GiB (mandatory)
    #[clap(short = 'b', long = "peb-size", value_name = "BYTES")]
    pub peb_size: Option<String>,

    /// Volume ID (mandatory)
    #[clap(short = 'I', long = "vol-id", value_name = "NUM")]
    pub vol_id: Option<String>,

    /// Minimum input/output unit size of the flash, in bytes, KiB, MiB or GiB (mandatory); e.g.
    /// the NAND page size
    #[clap(short = 'm', long = "min-io-size", value_name = "BYTES")]
    pub min_io_size: Option<String>,

    /// Volume type: dynamic or static (default is dynamic)
    #[clap(short = 't', long = "type", value_name = "static|dynamic")]
    pub vol_type: Option<String>,

    /// Minimum input/output unit used for UBI headers, e.g. the NAND sub-page size (default is
    /// the minimum input/output unit size)
    #[clap(short = 's', long = "sub-page-size", value_name = "BYTES")]
    pub sub_page_size: Option<String>,

    /// Volume alignment in bytes, KiB, MiB or GiB (default is 1)
    #[clap(short = 'a', long = "alignment", value_name = "BYTES")]
    pub alignment: Option<String>,

    /// Offset of the VID header from the start of the physical eraseblock (default is the next
    /// sub-page after the EC header)
    #[clap(short = 'O', long = "vid-hdr-offset", value_name = "NUM")]
    pub vid_hdr_offset: Option<String>,

    /// The erase counter value to put in EC headers (default is 0)
    #[clap(short = 'e', long = "erase-counter", value_name = "NUM")]
    pub erase_counter: Option<String>,

    /// UBI version number to put in headers (default is 1)
    #[clap(short = 'x', long = "ubi-ver", value_name = "NUM")]
    pub ubi_ver: Option<String>,

    /// Log more detail to stderr; repeat for even more
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

const LONG_ABOUT: &str = "\
A tool for adding UBI headers to a binary image.

Note, the images generated by this program are not ready to be used because they do not contain \
the volume table. If not sure about one of the parameters, do not specify it and let the utility \
use the default value.";

/// Identifies each option, for diagnostics
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Field {
    Infile,
    Outfile,
    PebSize,
    VolId,
    MinIoSize,
    VolType,
    SubPageSize,
    Alignment,
    VidHdrOffset,
    EraseCounter,
    UbiVer,
}

impl Field {
    /// The long option name
    pub fn flag(self) -> &'static str {
        match self {
            Field::Infile => "infile",
            Field::Outfile => "outfile",
            Field::PebSize => "peb-size",
            Field::VolId => "vol-id",
            Field::MinIoSize => "min-io-size",
            Field::VolType => "type",
            Field::SubPageSize => "sub-page-size",
            Field::Alignment => "alignment",
            Field::VidHdrOffset => "vid-hdr-offset",
            Field::EraseCounter => "erase-counter",
            Field::UbiVer => "ubi-ver",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Field::Infile => "input file",
            Field::Outfile => "output file",
            Field::PebSize => "physical eraseblock size",
            Field::VolId => "volume ID",
            Field::MinIoSize => "min. I/O unit size",
            Field::VolType => "volume type",
            Field::SubPageSize => "sub-page size",
            Field::Alignment => "volume alignment",
            Field::VidHdrOffset => "VID header offset",
            Field::EraseCounter => "erase counter value",
            Field::UbiVer => "UBI version",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (--{})", self.description(), self.flag())
    }
}

/// Why a set of options could not be turned into a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bad {field}: \"{raw}\"")]
    InvalidValue { field: Field, raw: String },

    #[error("bad size specifier for {field}: \"{raw}\" - should be 'KiB', 'MiB' or 'GiB'")]
    InvalidUnit { field: Field, raw: String },

    #[error("{0} was not specified (use -h for help)")]
    MissingRequired(Field),

    #[error("{small} {small_value} is larger than {large} {large_value}")]
    Inconsistent {
        small: Field,
        small_value: u32,
        large: Field,
        large_value: u32,
    },

    #[error("cannot open file \"{}\"", path.display())]
    IoOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The shape of the flash the image is destined for
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashGeometry {
    pub peb_size: NonZeroU32,
    pub min_io_size: NonZeroU32,

    /// Defaults to `min_io_size`. Not checked against it here; the generator rejects a sub-page
    /// larger than the minimum I/O unit.
    pub sub_page_size: NonZeroU32,

    /// 0 lets the generator pick, based on `sub_page_size`
    pub vid_hdr_offset: u32,
}

/// The single volume being generated
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VolumeSpec {
    pub id: u32,
    pub vol_type: VolType,
    pub alignment: NonZeroU32,
    pub erase_counter: u64,

    /// 0 selects the generator's default header version
    pub format_version: u32,
}

/// The stream the volume contents are read from
pub enum InputSource {
    File(File),
    Stream(Box<dyn Read>),
}

impl InputSource {
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        File::open(path)
            .map(InputSource::File)
            .map_err(|source| ConfigError::IoOpen {
                path: path.to_owned(),
                source,
            })
    }
}

impl Read for InputSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InputSource::File(file) => file.read(buf),
            InputSource::Stream(stream) => stream.read(buf),
        }
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::File(file) => f.debug_tuple("File").field(file).finish(),
            InputSource::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// The stream the image is written to
#[derive(Debug)]
pub enum OutputSink {
    Stdout(io::Stdout),
    File(File),
}

impl OutputSink {
    /// Create (or truncate) the file at `path`, or use stdout if there is none
    pub fn open(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(OutputSink::Stdout(io::stdout()));
        };

        File::create(path)
            .map(OutputSink::File)
            .map_err(|source| ConfigError::IoOpen {
                path: path.to_owned(),
                source,
            })
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputSink::Stdout(stdout) => stdout.write(buf),
            OutputSink::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Stdout(stdout) => stdout.flush(),
            OutputSink::File(file) => file.flush(),
        }
    }
}

/// The option values after parsing and defaulting, before any file is touched
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    pub geometry: FlashGeometry,
    pub volume: VolumeSpec,
    pub infile: PathBuf,
    pub outfile: Option<PathBuf>,
}

/// A fully-resolved invocation: what to build, and the streams to build it from and into
#[derive(Debug)]
pub struct Resolved {
    pub geometry: FlashGeometry,
    pub volume: VolumeSpec,
    pub input: InputSource,
    pub output: OutputSink,
}

fn parse_size_field(field: Field, raw: &str) -> Result<u64, ConfigError> {
    parse_size(raw).map_err(|error| match error {
        SizeError::UnknownUnit(_) => ConfigError::InvalidUnit {
            field,
            raw: raw.to_string(),
        },
        _ => ConfigError::InvalidValue {
            field,
            raw: raw.to_string(),
        },
    })
}

/// Parse a size that must be positive and fit in 32 bits
fn parse_nonzero_size(field: Field, raw: &str) -> Result<NonZeroU32, ConfigError> {
    let value = parse_size_field(field, raw)?;
    u32::try_from(value)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or_else(|| ConfigError::InvalidValue {
            field,
            raw: raw.to_string(),
        })
}

/// Parse a plain integer into whatever width the field has
fn parse_int_field<T: TryFrom<u64>>(field: Field, raw: &str) -> Result<T, ConfigError> {
    parse_int(raw)
        .ok()
        .and_then(|x| T::try_from(x).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field,
            raw: raw.to_string(),
        })
}

fn parse_vol_type(raw: &str) -> Result<VolType, ConfigError> {
    match raw {
        "dynamic" => Ok(VolType::Dynamic),
        "static" => Ok(VolType::Static),
        _ => Err(ConfigError::InvalidValue {
            field: Field::VolType,
            raw: raw.to_string(),
        }),
    }
}

/// Apply `parse` to an option if it was given
fn parse_opt<T>(
    raw: &Option<String>,
    parse: impl FnOnce(&str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConfigError> {
    raw.as_deref().map(parse).transpose()
}

impl Settings {
    /// Parse and validate the options without touching the filesystem.
    pub fn parse(opts: &RawOptions) -> Result<Self, ConfigError> {
        // Every given value is checked before anything is reported missing
        let peb_size = parse_opt(&opts.peb_size, |x| parse_nonzero_size(Field::PebSize, x))?;
        let min_io_size = parse_opt(&opts.min_io_size, |x| parse_nonzero_size(Field::MinIoSize, x))?;
        let sub_page_size =
            parse_opt(&opts.sub_page_size, |x| parse_nonzero_size(Field::SubPageSize, x))?;
        let alignment = parse_opt(&opts.alignment, |x| parse_nonzero_size(Field::Alignment, x))?;
        let vol_id: Option<u32> = parse_opt(&opts.vol_id, |x| parse_int_field(Field::VolId, x))?;
        let vol_type = parse_opt(&opts.vol_type, parse_vol_type)?;
        let vid_hdr_offset: Option<u32> =
            parse_opt(&opts.vid_hdr_offset, |x| parse_int_field(Field::VidHdrOffset, x))?;
        let erase_counter: Option<u64> =
            parse_opt(&opts.erase_counter, |x| parse_int_field(Field::EraseCounter, x))?;
        let ubi_ver: Option<u32> = parse_opt(&opts.ubi_ver, |x| parse_int_field(Field::UbiVer, x))?;

        let infile = opts.infile.clone().ok_or(ConfigError::MissingRequired(Field::Infile))?;
        let id = vol_id.ok_or(ConfigError::MissingRequired(Field::VolId))?;
        let peb_size = peb_size.ok_or(ConfigError::MissingRequired(Field::PebSize))?;
        let min_io_size = min_io_size.ok_or(ConfigError::MissingRequired(Field::MinIoSize))?;

        // Only once the minimum I/O unit size is settled
        let sub_page_size = sub_page_size.unwrap_or(min_io_size);

        if min_io_size > peb_size {
            return Err(ConfigError::Inconsistent {
                small: Field::MinIoSize,
                small_value: min_io_size.get(),
                large: Field::PebSize,
                large_value: peb_size.get(),
            });
        }

        Ok(Self {
            geometry: FlashGeometry {
                peb_size,
                min_io_size,
                sub_page_size,
                vid_hdr_offset: vid_hdr_offset.unwrap_or(0),
            },
            volume: VolumeSpec {
                id,
                vol_type: vol_type.unwrap_or_default(),
                alignment: alignment.unwrap_or(NonZeroU32::MIN),
                erase_counter: erase_counter.unwrap_or(0),
                format_version: ubi_ver.unwrap_or(0),
            },
            infile,
            outfile: opts.outfile.clone(),
        })
    }

    /// Open the streams. The input goes first, so an unreadable input never leaves an output file
    /// behind.
    pub fn open(self) -> Result<Resolved, ConfigError> {
        let input = InputSource::open(&self.infile)?;
        let output = OutputSink::open(self.outfile.as_deref())?;

        Ok(Resolved {
            geometry: self.geometry,
            volume: self.volume,
            input,
            output,
        })
    }
}

/// Resolve the options into a complete configuration with open streams.
pub fn resolve(opts: &RawOptions) -> Result<Resolved, ConfigError> {
    Settings::parse(opts)?.open()
}
