// Per-bucket index files (.idx.NNNNN, magic "DoubriI4").
//
// A record is `bytes_per_bucket` big-endian bucket bytes followed by the
// 8-byte big-endian trailer `(gid << 48) | iid`. Records are strictly sorted
// on their full byte string, so a raw byte comparison orders primarily by
// bucket and breaks ties by (group, item) without decoding anything.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::common::{read_u32_le, read_u64_le, write_u32_le, write_u64_le};
use crate::error::{Error, Result};

/// Magic bytes of an index file.
pub const INDEX_MAGIC: &[u8; 8] = b"DoubriI4";

/// Size of the packed (group, item) record trailer.
pub const TRAILER_BYTES: usize = 8;

/// Group ids are 16-bit.
pub const MAX_GROUP: u64 = 0xFFFF;

/// Item ordinals are 48-bit.
pub const MAX_ITEM: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Path of the index file for `bucket` under `basename`.
pub fn index_path(basename: &str, bucket: u32) -> PathBuf {
    PathBuf::from(format!("{basename}.idx.{bucket:05}"))
}

/// Pack a (group, item) pair into the big-endian record trailer.
pub fn pack_trailer(gid: u64, iid: u64) -> Result<[u8; TRAILER_BYTES]> {
    if gid > MAX_GROUP {
        return Err(Error::OutOfRange {
            reason: format!("group number {gid} does not fit in 16 bits"),
        });
    }
    if iid > MAX_ITEM {
        return Err(Error::OutOfRange {
            reason: format!("item number {iid} does not fit in 48 bits"),
        });
    }
    Ok(((gid << 48) | iid).to_be_bytes())
}

/// Split a record trailer back into its (group, item) pair.
pub fn unpack_trailer(trailer: [u8; TRAILER_BYTES]) -> (u16, u64) {
    let value = u64::from_be_bytes(trailer);
    ((value >> 48) as u16, value & MAX_ITEM)
}

/// Writer for one per-bucket index file.
pub struct IndexWriter {
    path: PathBuf,
    file: BufWriter<File>,
    pub bucket_number: u32,
    pub bytes_per_bucket: u32,
    num_written: u64,
}

impl IndexWriter {
    pub fn create(
        basename: &str,
        bucket_number: u32,
        bytes_per_bucket: u32,
        num_total_items: u64,
        num_active_items: u64,
    ) -> Result<Self> {
        let path = index_path(basename, bucket_number);
        let file = File::create(&path).map_err(|source| Error::IoOpen {
            path: path.clone(),
            source,
        })?;
        let mut file = BufWriter::new(file);

        let header = |file: &mut BufWriter<File>| -> std::io::Result<()> {
            file.write_all(INDEX_MAGIC)?;
            write_u32_le(file, bucket_number)?;
            write_u32_le(file, bytes_per_bucket)?;
            write_u64_le(file, num_total_items)?;
            write_u64_le(file, num_active_items)
        };
        header(&mut file).map_err(|source| Error::IoWrite {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            file,
            bucket_number,
            bytes_per_bucket,
            num_written: 0,
        })
    }

    pub fn num_written(&self) -> u64 {
        self.num_written
    }

    /// Append one record from its parts. Range-checks the (group, item) pair.
    pub fn write_item(&mut self, gid: u64, iid: u64, bucket: &[u8]) -> Result<()> {
        debug_assert_eq!(bucket.len(), self.bytes_per_bucket as usize);
        let trailer = pack_trailer(gid, iid)?;
        let write = |file: &mut BufWriter<File>| -> std::io::Result<()> {
            file.write_all(bucket)?;
            file.write_all(&trailer)
        };
        write(&mut self.file).map_err(|source| Error::IoWrite {
            path: self.path.clone(),
            source,
        })?;
        self.num_written += 1;
        Ok(())
    }

    /// Copy one already-encoded record (bucket plus trailer) straight
    /// through, so the merger never re-encodes what it read.
    pub fn write_raw(&mut self, record: &[u8]) -> Result<()> {
        debug_assert_eq!(
            record.len(),
            self.bytes_per_bucket as usize + TRAILER_BYTES
        );
        self.file
            .write_all(record)
            .map_err(|source| Error::IoWrite {
                path: self.path.clone(),
                source,
            })?;
        self.num_written += 1;
        Ok(())
    }

    /// Flush; used when `num_active_items` was already correct at creation.
    pub fn close(mut self) -> Result<()> {
        self.file.flush().map_err(|source| Error::IoWrite {
            path: self.path.clone(),
            source,
        })
    }

    /// Flush and patch `num_active_items` (header offset 24) once the true
    /// survivor count is known.
    pub fn finish(mut self, num_active_items: u64) -> Result<()> {
        let map_write = |source| Error::IoWrite {
            path: self.path.clone(),
            source,
        };
        self.file.flush().map_err(map_write)?;
        let mut file = self
            .file
            .into_inner()
            .map_err(|e| map_write(e.into_error()))?;
        file.seek(SeekFrom::Start(24))
            .map_err(|source| Error::IoSeek {
                path: self.path.clone(),
                source,
            })?;
        write_u64_le(&mut file, num_active_items).map_err(map_write)
    }
}

/// Streaming reader for one per-bucket index file.
pub struct IndexReader {
    path: PathBuf,
    file: BufReader<File>,
    pub bucket_number: u32,
    pub bytes_per_bucket: u32,
    pub num_total_items: u64,
    pub num_active_items: u64,
    remaining: u64,
}

impl IndexReader {
    /// Open `<basename>.idx.NNNNN` and validate its header against the
    /// expected bucket number.
    pub fn open(basename: &str, bucket: u32) -> Result<Self> {
        let path = index_path(basename, bucket);
        let file = File::open(&path).map_err(|source| Error::IoOpen {
            path: path.clone(),
            source,
        })?;
        let mut file = BufReader::new(file);

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic).map_err(|source| Error::IoRead {
            path: path.clone(),
            source,
        })?;
        if &magic != INDEX_MAGIC {
            return Err(Error::BadMagic { path, found: magic });
        }

        let map_read = |source| Error::IoRead {
            path: path.clone(),
            source,
        };
        let bucket_number = read_u32_le(&mut file).map_err(map_read)?;
        let bytes_per_bucket = read_u32_le(&mut file).map_err(map_read)?;
        let num_total_items = read_u64_le(&mut file).map_err(map_read)?;
        let num_active_items = read_u64_le(&mut file).map_err(map_read)?;

        if bucket_number != bucket {
            return Err(Error::BadHeader {
                path,
                reason: format!("bucket number {bucket_number} (expected {bucket})"),
            });
        }

        Ok(Self {
            path,
            file,
            bucket_number,
            bytes_per_bucket,
            num_total_items,
            num_active_items,
            remaining: num_active_items,
        })
    }

    /// Size of one full record in bytes.
    pub fn record_len(&self) -> usize {
        self.bytes_per_bucket as usize + TRAILER_BYTES
    }

    /// Read the next record into `buf` (`record_len` bytes); `false` once
    /// all `num_active_items` records have been consumed.
    pub fn next_record(&mut self, buf: &mut [u8]) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        self.file.read_exact(buf).map_err(|source| Error::IoRead {
            path: self.path.clone(),
            source,
        })?;
        self.remaining -= 1;
        Ok(true)
    }
}
