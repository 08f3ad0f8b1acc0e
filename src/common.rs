// Shared low-level helpers for the binary stores and JSONL inputs.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::{Error, Result};

// All on-disk header fields are little-endian; payload bytes (buckets and
// index trailers) are big-endian and never pass through these helpers.

pub(crate) fn read_u32_le(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64_le(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn write_u32_le(writer: &mut impl Write, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub(crate) fn write_u64_le(writer: &mut impl Write, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

/// Open a JSONL input stream: stdin when `path` is `None`, otherwise a
/// plain, `.gz`, or `.zst` file.
pub fn open_jsonl_input(path: Option<&Path>) -> Result<Box<dyn BufRead>> {
    let Some(path) = path else {
        return Ok(Box::new(BufReader::new(io::stdin())));
    };

    let file = File::open(path).map_err(|source| Error::IoOpen {
        path: path.to_path_buf(),
        source,
    })?;

    let reader: Box<dyn Read> = match path.extension().and_then(|s| s.to_str()) {
        Some("gz") => Box::new(GzDecoder::new(file)),
        Some("zst") => Box::new(ZstdDecoder::new(file).map_err(|source| Error::IoOpen {
            path: path.to_path_buf(),
            source,
        })?),
        _ => Box::new(file),
    };
    Ok(Box::new(BufReader::new(reader)))
}
