// Within-group deduplication over signature bucket columns.
//
// One bucket column for all items of the group is held in a single
// contiguous arena; items are sorted as integer handles whose comparator
// reaches into the arena. Duplicates inside a column are found with one
// linear adjacent-equality scan over the sorted handles.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use mj_io::{build_pbar, write_mem_to_pathbuf};
use rayon::prelude::*;
use tracing::{info, trace};

use crate::error::{Error, Result};
use crate::flags::{
    load_flags, save_flags, SourceEntry, SourceManifest, FLAG_ACTIVE, FLAG_DEAD, FLAG_MARKED,
};
use crate::index::{IndexWriter, MAX_GROUP};
use crate::store::SignatureReader;

/// One signature file of the fan-in set, with its slot in the global
/// ordinal space.
struct SourceFile {
    path: String,
    num_items: u64,
    start_index: u64,
}

/// Options of one deduplication run.
pub struct DedupOptions {
    pub group: u64,
    pub save_index: bool,
}

/// Counters reported after each bucket pass.
#[derive(Debug, Clone, Copy)]
pub struct PassStats {
    pub num_active_before: u64,
    pub num_detected: u64,
    pub num_active_after: u64,
}

/// The deduplication engine: signature files, the bucket-column arena, the
/// sort handles, and the per-item flags.
pub struct GroupDedup {
    files: Vec<SourceFile>,
    num_items: u64,
    bytes_per_hash: u32,
    num_hash_values: u32,
    begin: u32,
    end: u32,
    buffer: Vec<u8>,
    order: Vec<u64>,
    flags: Vec<u8>,
}

impl GroupDedup {
    /// Open every signature file, check that all of them agree on the
    /// signature parameters, and allocate the arena for one bucket column.
    pub fn new(paths: Vec<String>) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        let mut num_items = 0u64;
        let mut params: Option<(u32, u32, u32, u32)> = None;

        info!("# signature files: {}", paths.len());
        for path in paths {
            let reader = SignatureReader::open(Path::new(&path))?;
            let these = (
                reader.bytes_per_hash,
                reader.num_hash_values,
                reader.begin,
                reader.end,
            );
            match params {
                None => {
                    info!("bytes_per_hash: {}", reader.bytes_per_hash);
                    info!("num_hash_values: {}", reader.num_hash_values);
                    info!("begin: {}", reader.begin);
                    info!("end: {}", reader.end);
                    params = Some(these);
                }
                Some(expected) if expected != these => {
                    return Err(Error::BadHeader {
                        path: path.into(),
                        reason: format!(
                            "signature parameters {these:?} differ from the first file's {expected:?}"
                        ),
                    });
                }
                Some(_) => {}
            }
            files.push(SourceFile {
                path,
                num_items: reader.num_items as u64,
                start_index: num_items,
            });
            num_items += reader.num_items as u64;
        }
        info!("# items: {}", num_items);

        let (bytes_per_hash, num_hash_values, begin, end) = params.unwrap_or((4, 0, 0, 0));
        let bytes_per_bucket = (bytes_per_hash * num_hash_values) as u64;

        // One contiguous block keeps the comparator a plain slice compare
        // and the column reads a handful of dense writes.
        let arena_bytes = num_items * bytes_per_bucket;
        info!(
            "Allocating {:.3} MB for the bucket column arena",
            arena_bytes as f64 / 1e6
        );
        let buffer = vec![0u8; arena_bytes as usize];
        let order = Vec::with_capacity(num_items as usize);
        let flags = vec![FLAG_ACTIVE; num_items as usize];

        Ok(Self {
            files,
            num_items,
            bytes_per_hash,
            num_hash_values,
            begin,
            end,
            buffer,
            order,
            flags,
        })
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    pub fn bucket_range(&self) -> (u32, u32) {
        (self.begin, self.end)
    }

    pub fn flags(&self) -> &[u8] {
        &self.flags
    }

    fn bytes_per_bucket(&self) -> usize {
        (self.bytes_per_hash * self.num_hash_values) as usize
    }

    /// The manifest describing this run's concatenation order.
    pub fn manifest(&self, group: u64) -> SourceManifest {
        SourceManifest {
            group: Some(group as u32),
            entries: self
                .files
                .iter()
                .map(|f| SourceEntry {
                    num_items: f.num_items,
                    path: f.path.clone(),
                })
                .collect(),
        }
    }

    /// Resume from the flags of an earlier run.
    pub fn load_prior_flags(&mut self, path: &Path) -> Result<()> {
        info!("Loading flags from {}", path.display());
        let flags = load_flags(path)?;
        if flags.len() as u64 != self.num_items {
            return Err(Error::InconsistentSize {
                reason: format!("flag file {}", path.display()),
                expected: self.num_items,
                actual: flags.len() as u64,
            });
        }
        self.flags = flags;
        Ok(())
    }

    fn count_flag(&self, flag: u8) -> u64 {
        self.flags.iter().filter(|&&b| b == flag).count() as u64
    }

    /// One deduplication pass over bucket column `bucket`.
    pub fn dedup_bucket(
        &mut self,
        bucket: u32,
        basename: &str,
        opts: &DedupOptions,
    ) -> Result<PassStats> {
        let sw = Instant::now();
        let w = self.bytes_per_bucket();

        // Fan-in read: every signature file fills its own disjoint slice of
        // the arena, so no synchronization is needed.
        let sw_read = Instant::now();
        info!("[#{bucket}] Reading buckets from {} files", self.files.len());
        let pbar = build_pbar(self.files.len(), "files");
        let mut tasks: Vec<(&SourceFile, &mut [u8])> = Vec::with_capacity(self.files.len());
        let mut rest = self.buffer.as_mut_slice();
        for file in &self.files {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(file.num_items as usize * w);
            tasks.push((file, head));
            rest = tail;
        }
        tasks.into_par_iter().try_for_each(|(file, dst)| {
            trace!(
                "[#{bucket}] Reading {} buckets from {} at ordinal {}",
                file.num_items,
                file.path,
                file.start_index
            );
            let mut reader = SignatureReader::open(Path::new(&file.path))?;
            reader.read_bucket_column(dst, bucket)?;
            pbar.inc(1);
            Ok::<(), Error>(())
        })?;
        pbar.finish_and_clear();
        info!(
            "[#{bucket}] Completed reading in {:.3} seconds",
            sw_read.elapsed().as_secs_f64()
        );

        // Sort handles by bucket bytes with the global ordinal as tiebreak.
        // The tiebreak makes the order total, so the first item of every run
        // of equal buckets is always the smallest ordinal.
        let sw_sort = Instant::now();
        info!("[#{bucket}] Sorting buckets");
        self.order.clear();
        self.order.extend(0..self.num_items);
        let buffer = &self.buffer;
        self.order.par_sort_unstable_by(|&a, &b| {
            let x = &buffer[a as usize * w..][..w];
            let y = &buffer[b as usize * w..][..w];
            x.cmp(y).then_with(|| a.cmp(&b))
        });
        info!(
            "[#{bucket}] Completed sorting in {:.3} seconds",
            sw_sort.elapsed().as_secs_f64()
        );

        let num_active_before = self.count_flag(FLAG_ACTIVE);

        // Mark every item that shares a bucket with an earlier item. The
        // equality test ignores ordinals, so a run is a duplicate class and
        // its first entry the canonical survivor.
        let n = self.order.len();
        let mut i = 0;
        while i < n {
            let a = self.order[i] as usize * w;
            let mut j = i + 1;
            while j < n {
                let b = self.order[j] as usize * w;
                if self.buffer[a..a + w] != self.buffer[b..b + w] {
                    break;
                }
                self.flags[self.order[j] as usize] = FLAG_MARKED;
                j += 1;
            }
            i = j;
        }

        let num_detected = self.count_flag(FLAG_MARKED);
        let num_active_after = self.count_flag(FLAG_ACTIVE);

        // Save the per-bucket index of items that survived this pass.
        if opts.save_index {
            let mut writer = IndexWriter::create(
                basename,
                bucket,
                w as u32,
                self.num_items,
                self.num_items - num_detected,
            )?;
            info!("[#{bucket}] Saving the index");
            let sw_save = Instant::now();
            for &iid in &self.order {
                if self.flags[iid as usize] != FLAG_MARKED {
                    let at = iid as usize * w;
                    writer.write_item(opts.group, iid, &self.buffer[at..at + w])?;
                }
            }
            writer.close()?;
            info!(
                "[#{bucket}] Completed saving the index in {:.3} seconds",
                sw_save.elapsed().as_secs_f64()
            );
        }

        // Promote the per-pass marks; flags only ever move towards 'D'.
        for flag in &mut self.flags {
            if *flag == FLAG_MARKED {
                *flag = FLAG_DEAD;
            }
        }

        let stats = PassStats {
            num_active_before,
            num_detected,
            num_active_after,
        };
        let ratio = |count: u64| {
            if self.num_items > 0 {
                count as f64 / self.num_items as f64
            } else {
                0.0
            }
        };
        info!(
            "[#{bucket}] Completed: {}",
            serde_json::json!({
                "num_active_before": stats.num_active_before,
                "num_detected": stats.num_detected,
                "num_active_after": stats.num_active_after,
                "active_ratio": ratio(stats.num_active_after),
                "detection_ratio": ratio(stats.num_detected),
                "seconds": sw.elapsed().as_secs_f64(),
            })
        );
        Ok(stats)
    }

    /// Run all bucket passes in column order.
    pub fn run(&mut self, basename: &str, opts: &DedupOptions) -> Result<()> {
        let sw = Instant::now();
        let num_active_before = self.count_flag(FLAG_ACTIVE);

        for bucket in self.begin..self.end {
            info!("Deduplication pass for bucket #{bucket}");
            self.dedup_bucket(bucket, basename, opts)?;
        }

        let num_active_after = self.count_flag(FLAG_ACTIVE);
        let ratio = |count: u64| {
            if self.num_items > 0 {
                count as f64 / self.num_items as f64
            } else {
                0.0
            }
        };
        info!(
            "Result: {}",
            serde_json::json!({
                "num_items": self.num_items,
                "bytes_per_hash": self.bytes_per_hash,
                "num_hash_values": self.num_hash_values,
                "begin": self.begin,
                "end": self.end,
                "num_active_before": num_active_before,
                "num_active_after": num_active_after,
                "active_ratio_before": ratio(num_active_before),
                "active_ratio_after": ratio(num_active_after),
                "seconds": sw.elapsed().as_secs_f64(),
            })
        );
        Ok(())
    }
}

/// Deduplicate the given signature files as group `group`, writing
/// `<basename>.idx.NNNNN`, `<basename>.dup`, and `<basename>.src`.
pub fn run_dedup(
    paths: Vec<String>,
    basename: &str,
    group: u64,
    no_index: bool,
    ignore_flag: bool,
) -> anyhow::Result<()> {
    if group > MAX_GROUP {
        return Err(Error::OutOfRange {
            reason: format!("group number {group} must be in [0, {MAX_GROUP}]"),
        }
        .into());
    }

    let mut engine = GroupDedup::new(paths)?;

    // Persist the concatenation order first so a later filter step can map
    // global ordinals back to shards even if this run is interrupted.
    let src_path = format!("{basename}.src");
    write_mem_to_pathbuf(&engine.manifest(group).to_bytes(), &PathBuf::from(&src_path))
        .with_context(|| format!("failed to write the source manifest {src_path}"))?;

    let flag_path = format!("{basename}.dup");
    if ignore_flag {
        info!("Ignoring any existing flag file (cold start)");
    } else if Path::new(&flag_path).exists() {
        engine.load_prior_flags(Path::new(&flag_path))?;
    } else {
        info!("Flag file does not exist yet: {flag_path}");
    }

    engine.run(
        basename,
        &DedupOptions {
            group,
            save_index: !no_index,
        },
    )?;

    info!("Saving flags to {flag_path}");
    save_flags(Path::new(&flag_path), engine.flags())?;
    Ok(())
}

/// CLI entry: signature file paths are read from stdin, one per line.
pub fn execute_dedup(
    basename: &str,
    group: u64,
    no_index: bool,
    ignore_flag: bool,
) -> anyhow::Result<()> {
    let paths = io::stdin()
        .lock()
        .lines()
        .collect::<io::Result<Vec<String>>>()
        .context("failed to read signature file paths from stdin")?;
    let paths: Vec<String> = paths
        .into_iter()
        .filter(|line| !line.trim().is_empty())
        .collect();

    run_dedup(paths, basename, group, no_index, ignore_flag)
}
