//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

use thiserror::Error;

pub trait ReadExt {
    /// Tries to read exactly `read_len` bytes, like `read_exact`, but unlike `read_exact`, is
    /// forgiving of unexpected EOF.
    ///
    /// The returned vector will have exactly `read_len` bytes appended, unless an EOF was
    /// encountered, in which case it will have strictly shorter than `read_len` new bytes added.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read + ?Sized> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        const CHUNK_SIZE: usize = 65536;

        let read_len = read_len + vec.len();
        let mut cursor = vec.len();
        loop {
            debug_assert!(cursor <= read_len);
            if cursor == read_len {
                // All requested reading has been done.
                return Ok(());
            }

            // Make room for the next chunk
            vec.resize(std::cmp::min(read_len, cursor + CHUNK_SIZE), 0u8);

            // Perform the read, handle errors, and advance `cursor`
            cursor += match self.read(&mut vec[cursor..]) {
                // This is an EOF; it means the final read size is `cursor`
                Ok(0) => {
                    vec.truncate(cursor);
                    return Ok(());
                }

                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => {
                    vec.truncate(cursor);
                    return Err(x);
                }
            };
        }
    }
}

/// Reasons a numeric command-line value can be rejected
#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum SizeError {
    #[error("not a non-negative integer")]
    NotANumber,

    #[error("bad size specifier \"{0}\"; should be 'KiB', 'MiB' or 'GiB'")]
    UnknownUnit(String),

    #[error("value out of range")]
    Overflow,
}

/// Map a binary unit suffix to its multiplier.
pub fn unit_multiplier(unit: &str) -> Option<u64> {
    match unit {
        "KiB" => Some(1 << 10),
        "MiB" => Some(1 << 20),
        "GiB" => Some(1 << 30),
        _ => None,
    }
}

/// Split the leading decimal (or `0x`-prefixed hexadecimal) integer off of `s`.
fn split_number(s: &str) -> Result<(u64, &str), SizeError> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };

    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    if end == 0 {
        return Err(SizeError::NotANumber);
    }

    let value = u64::from_str_radix(&digits[..end], radix).map_err(|_| SizeError::Overflow)?;
    Ok((value, &digits[end..]))
}

/// Parse a plain integer, with nothing trailing it.
pub fn parse_int(s: &str) -> Result<u64, SizeError> {
    match split_number(s)? {
        (value, "") => Ok(value),
        _ => Err(SizeError::NotANumber),
    }
}

/// Parse an integer optionally followed by a `KiB`, `MiB` or `GiB` suffix.
pub fn parse_size(s: &str) -> Result<u64, SizeError> {
    let (value, rest) = split_number(s)?;

    let unit = rest.trim_start_matches([' ', '\t']);
    if unit.is_empty() {
        return Ok(value);
    }

    let multiplier =
        unit_multiplier(unit).ok_or_else(|| SizeError::UnknownUnit(unit.to_string()))?;
    value.checked_mul(multiplier).ok_or(SizeError::Overflow)
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    io::repeat(0xBB).read_to_vec(&mut vec, 2)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_parse_size() {
    assert_eq!(parse_size("0"), Ok(0));
    assert_eq!(parse_size("2048"), Ok(2048));
    assert_eq!(parse_size("0x800"), Ok(2048));
    assert_eq!(parse_size("128KiB"), Ok(128 * 1024));
    assert_eq!(parse_size("3MiB"), Ok(3 * 1024 * 1024));
    assert_eq!(parse_size("2GiB"), Ok(2 * 1024 * 1024 * 1024));
    assert_eq!(parse_size("16 KiB"), Ok(16 * 1024));

    assert_eq!(parse_size("4kib"), Err(SizeError::UnknownUnit("kib".into())));
    assert_eq!(parse_size("4KB"), Err(SizeError::UnknownUnit("KB".into())));
    assert_eq!(parse_size("KiB"), Err(SizeError::NotANumber));
    assert_eq!(parse_size(""), Err(SizeError::NotANumber));
    assert_eq!(parse_size("-1"), Err(SizeError::NotANumber));
    assert_eq!(
        parse_size("99999999999999999999"),
        Err(SizeError::Overflow)
    );
    assert_eq!(parse_size("0xFFFFFFFFFFFFGiB"), Err(SizeError::Overflow));
}

#[test]
fn test_parse_int() {
    assert_eq!(parse_int("17"), Ok(17));
    assert_eq!(parse_int("0X1f"), Ok(31));
    assert_eq!(parse_int("1KiB"), Err(SizeError::NotANumber));
    assert_eq!(parse_int("12abc"), Err(SizeError::NotANumber));
    assert_eq!(parse_int("0x"), Err(SizeError::NotANumber));
}
