// Bucket-major signature store (.mh files, magic "DoubriH4").
//
// An item-major layout makes the later column reads pathological: a 512-byte
// physical sector yields a single bucket per read. Items are therefore
// grouped into chunks of up to `SECTOR_SIZE` items, and each chunk stores its
// bucket columns contiguously, so one column across all items is a dense run
// per chunk (roughly a 20x I/O reduction at H=40 with 80-byte buckets).

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::common::{read_u32_le, write_u32_le};
use crate::error::{Error, Result};

/// Magic bytes of a signature file.
pub const SIGNATURE_MAGIC: &[u8; 8] = b"DoubriH4";

/// Items per chunk. One chunk of one bucket column spans whole physical
/// sectors, which keeps column reads sector-aligned.
pub const SECTOR_SIZE: u32 = 512;

/// On-disk size of one hash value (murmur3 x86 32-bit).
pub const BYTES_PER_HASH: u32 = 4;

/// Streaming writer for signature files.
///
/// Hash values are buffered into one in-memory chunk per bucket column and
/// flushed column by column whenever `SECTOR_SIZE` items have accumulated.
/// The item count is patched into the header on close.
pub struct SignatureWriter {
    path: PathBuf,
    file: BufWriter<File>,
    num_items: u64,
    num_hash_values: u32,
    begin: u32,
    end: u32,
    columns: Vec<Vec<u8>>,
    slot: u32,
}

impl SignatureWriter {
    pub fn create(path: &Path, num_hash_values: u32, begin: u32, end: u32) -> Result<Self> {
        if end <= begin {
            return Err(Error::OutOfRange {
                reason: format!("empty bucket range [{begin}, {end})"),
            });
        }

        let file = File::create(path).map_err(|source| Error::IoOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let mut file = BufWriter::new(file);

        let header = |file: &mut BufWriter<File>| -> std::io::Result<()> {
            file.write_all(SIGNATURE_MAGIC)?;
            // Reserve the item-count slot; close() patches it.
            write_u32_le(file, 0)?;
            write_u32_le(file, BYTES_PER_HASH)?;
            write_u32_le(file, num_hash_values)?;
            write_u32_le(file, begin)?;
            write_u32_le(file, end)?;
            write_u32_le(file, SECTOR_SIZE)
        };
        header(&mut file).map_err(|source| Error::IoWrite {
            path: path.to_path_buf(),
            source,
        })?;

        let chunk_bytes =
            SECTOR_SIZE as usize * num_hash_values as usize * BYTES_PER_HASH as usize;
        let columns = vec![vec![0u8; chunk_bytes]; (end - begin) as usize];

        Ok(Self {
            path: path.to_path_buf(),
            file,
            num_items: 0,
            num_hash_values,
            begin,
            end,
            columns,
            slot: 0,
        })
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    /// Append one item. `hashes` holds the bucket rows for columns
    /// `begin..end` back to back, `num_hash_values` values per bucket.
    pub fn put(&mut self, hashes: &[u32]) -> Result<()> {
        debug_assert_eq!(
            hashes.len(),
            ((self.end - self.begin) * self.num_hash_values) as usize
        );

        if self.slot == SECTOR_SIZE {
            self.flush_chunk()?;
        }

        let h = self.num_hash_values as usize;
        let offset = self.slot as usize * h * BYTES_PER_HASH as usize;
        for (column, row) in self.columns.iter_mut().zip(hashes.chunks_exact(h)) {
            for (j, &value) in row.iter().enumerate() {
                // Big-endian, so lexicographic byte order equals numeric
                // order of the packed hash tuple.
                let at = offset + j * BYTES_PER_HASH as usize;
                column[at..at + 4].copy_from_slice(&value.to_be_bytes());
            }
        }

        self.slot += 1;
        self.num_items += 1;
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.slot > 0 {
            let used =
                self.slot as usize * self.num_hash_values as usize * BYTES_PER_HASH as usize;
            for column in &self.columns {
                self.file
                    .write_all(&column[..used])
                    .map_err(|source| Error::IoWrite {
                        path: self.path.clone(),
                        source,
                    })?;
            }
        }
        self.slot = 0;
        Ok(())
    }

    /// Flush the partial last chunk and patch `num_items` into the header.
    pub fn close(mut self) -> Result<u64> {
        self.flush_chunk()?;

        let count = u32::try_from(self.num_items).map_err(|_| Error::OutOfRange {
            reason: format!(
                "{} items do not fit in the 32-bit item count",
                self.num_items
            ),
        })?;

        let map_write = |source| Error::IoWrite {
            path: self.path.clone(),
            source,
        };
        self.file.flush().map_err(map_write)?;

        let mut file = self
            .file
            .into_inner()
            .map_err(|e| map_write(e.into_error()))?;
        file.seek(SeekFrom::Start(8)).map_err(|source| Error::IoSeek {
            path: self.path.clone(),
            source,
        })?;
        write_u32_le(&mut file, count).map_err(map_write)?;

        Ok(self.num_items)
    }
}

/// Reader that reassembles whole bucket columns from a signature file.
pub struct SignatureReader {
    path: PathBuf,
    file: File,
    pub num_items: u32,
    pub bytes_per_hash: u32,
    pub num_hash_values: u32,
    pub begin: u32,
    pub end: u32,
}

impl SignatureReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|source| Error::IoOpen {
            path: path.to_path_buf(),
            source,
        })?;

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic).map_err(|source| Error::IoRead {
            path: path.to_path_buf(),
            source,
        })?;
        if &magic != SIGNATURE_MAGIC {
            return Err(Error::BadMagic {
                path: path.to_path_buf(),
                found: magic,
            });
        }

        let mut field = |file: &mut File| {
            read_u32_le(file).map_err(|source| Error::IoRead {
                path: path.to_path_buf(),
                source,
            })
        };
        let num_items = field(&mut file)?;
        let bytes_per_hash = field(&mut file)?;
        let num_hash_values = field(&mut file)?;
        let begin = field(&mut file)?;
        let end = field(&mut file)?;
        let sector_size = field(&mut file)?;

        if sector_size != SECTOR_SIZE {
            return Err(Error::BadHeader {
                path: path.to_path_buf(),
                reason: format!("sector size {sector_size} (expected {SECTOR_SIZE})"),
            });
        }
        if end <= begin {
            return Err(Error::BadHeader {
                path: path.to_path_buf(),
                reason: format!("empty bucket range [{begin}, {end})"),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            num_items,
            bytes_per_hash,
            num_hash_values,
            begin,
            end,
        })
    }

    /// Size of one bucket (one column entry for one item) in bytes.
    pub fn bytes_per_bucket(&self) -> usize {
        (self.bytes_per_hash * self.num_hash_values) as usize
    }

    /// Read the complete column `bucket` into `dst`, which must hold
    /// `num_items * bytes_per_bucket` bytes. The column is scattered across
    /// chunks on disk and contiguous in `dst`.
    pub fn read_bucket_column(&mut self, dst: &mut [u8], bucket: u32) -> Result<()> {
        if bucket < self.begin || self.end <= bucket {
            return Err(Error::OutOfRange {
                reason: format!(
                    "bucket {bucket} outside [{}, {}) in {}",
                    self.begin,
                    self.end,
                    self.path.display()
                ),
            });
        }

        let per_item = self.bytes_per_bucket() as u64;
        let expected = self.num_items as u64 * per_item;
        if dst.len() as u64 != expected {
            return Err(Error::InconsistentSize {
                reason: format!("column buffer for {}", self.path.display()),
                expected,
                actual: dst.len() as u64,
            });
        }

        let num_full = (self.num_items / SECTOR_SIZE) as u64;
        let remainder = (self.num_items % SECTOR_SIZE) as u64;
        let chunk_column_bytes = SECTOR_SIZE as u64 * per_item;
        let chunk_stride = (self.end - self.begin) as u64 * chunk_column_bytes;
        let column = (bucket - self.begin) as u64;

        let mut at = 0usize;
        for chunk in 0..num_full {
            let offset = 32 + chunk_stride * chunk + chunk_column_bytes * column;
            self.read_at(offset, &mut dst[at..at + chunk_column_bytes as usize])?;
            at += chunk_column_bytes as usize;
        }
        if remainder > 0 {
            // The last chunk is packed with the remainder stride.
            let bytes = remainder * per_item;
            let offset = 32 + chunk_stride * num_full + bytes * column;
            self.read_at(offset, &mut dst[at..at + bytes as usize])?;
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|source| Error::IoSeek {
                path: self.path.clone(),
                source,
            })?;
        self.file.read_exact(dst).map_err(|source| Error::IoRead {
            path: self.path.clone(),
            source,
        })
    }
}
