// K-way merge of per-group bucket indices.
//
// Every input index is strictly sorted on its full record bytes, so a
// min-heap over the head record of each reader yields the merged order
// without decoding anything. When several groups carry the same bucket, the
// record with the lexicographically smallest (group, item) trailer pops
// first and survives; the others are drained as duplicates.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{ensure, Context};
use mj_io::build_pbar;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::index::{unpack_trailer, IndexReader, IndexWriter, TRAILER_BYTES};

/// Entry of the K-way merge heap.
struct MergeEntry {
    record: Vec<u8>,
    source: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record && self.source == other.source
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (BinaryHeap is max-heap by default).
        other
            .record
            .cmp(&self.record)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Counters of one merged bucket column.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeStats {
    pub num_total_items: u64,
    pub survivors: u64,
    pub duplicates: u64,
}

/// Merge the index files of `sources` for one bucket column into
/// `<output>.idx.NNNNN`. Eliminated records go to `dup_sink` as
/// `"<gid>\t<iid>"` lines when a sink is given.
pub fn merge_bucket(
    sources: &[String],
    output: &str,
    bucket: u32,
    mut dup_sink: Option<&mut dyn Write>,
) -> Result<MergeStats> {
    let mut readers = sources
        .iter()
        .map(|basename| IndexReader::open(basename, bucket))
        .collect::<Result<Vec<_>>>()?;

    // All groups must agree on the record geometry.
    let Some((first, rest)) = readers.split_first() else {
        return Err(Error::OutOfRange {
            reason: "no index sources to merge".into(),
        });
    };
    let bytes_per_bucket = first.bytes_per_bucket;
    for (k, reader) in rest.iter().enumerate() {
        if reader.bytes_per_bucket != bytes_per_bucket {
            return Err(Error::BadHeader {
                path: crate::index::index_path(&sources[k + 1], bucket),
                reason: format!(
                    "bytes_per_bucket {} differs from the first group's {}",
                    reader.bytes_per_bucket, bytes_per_bucket
                ),
            });
        }
    }

    let num_total_items: u64 = readers.iter().map(|r| r.num_total_items).sum();
    let record_len = bytes_per_bucket as usize + TRAILER_BYTES;
    let w = bytes_per_bucket as usize;

    // The survivor count is only known at the end; patch it on finish.
    let mut writer = IndexWriter::create(output, bucket, bytes_per_bucket, num_total_items, 0)?;

    let mut heap = BinaryHeap::with_capacity(readers.len());
    let mut record = vec![0u8; record_len];
    for (source, reader) in readers.iter_mut().enumerate() {
        if reader.next_record(&mut record)? {
            heap.push(MergeEntry {
                record: record.clone(),
                source,
            });
        }
    }

    let mut stats = MergeStats {
        num_total_items,
        ..MergeStats::default()
    };
    while let Some(top) = heap.pop() {
        writer.write_raw(&top.record)?;
        stats.survivors += 1;

        // Drain every record that matches the survivor on bucket bytes
        // alone; the trailer difference is exactly what makes it a
        // cross-group duplicate.
        while heap
            .peek()
            .is_some_and(|next| next.record[..w] == top.record[..w])
        {
            let Some(dup) = heap.pop() else { break };
            stats.duplicates += 1;
            if let Some(sink) = dup_sink.as_mut() {
                let trailer = dup.record[w..].try_into().unwrap_or([0u8; TRAILER_BYTES]);
                let (gid, iid) = unpack_trailer(trailer);
                writeln!(sink, "{gid}\t{iid}").map_err(|source| Error::IoWrite {
                    path: PathBuf::from("duplicate sink"),
                    source,
                })?;
            }
            if readers[dup.source].next_record(&mut record)? {
                heap.push(MergeEntry {
                    record: record.clone(),
                    source: dup.source,
                });
            }
        }

        if readers[top.source].next_record(&mut record)? {
            heap.push(MergeEntry {
                record: record.clone(),
                source: top.source,
            });
        }
    }

    writer.finish(stats.survivors)?;
    Ok(stats)
}

/// Merge all bucket columns `begin..end` across the per-group index
/// basenames in `sources`.
pub fn execute_merge(
    sources: &[String],
    output: &str,
    begin: u32,
    end: u32,
    duplicates: Option<&Path>,
) -> anyhow::Result<()> {
    ensure!(!sources.is_empty(), "at least one index source is required");
    ensure!(begin < end, "bucket range is empty: [{begin}, {end})");

    let mut sink = match duplicates {
        Some(path) => Some(BufWriter::new(File::create(path).map_err(|source| {
            Error::IoOpen {
                path: path.to_path_buf(),
                source,
            }
        })?)),
        None => None,
    };

    let sw = Instant::now();
    let mut totals = MergeStats::default();
    let pbar = build_pbar((end - begin) as usize, "buckets");
    for bucket in begin..end {
        let stats = merge_bucket(
            sources,
            output,
            bucket,
            sink.as_mut().map(|s| s as &mut dyn Write),
        )?;
        debug!(
            "[#{bucket}] merged: {}",
            serde_json::json!({
                "num_total_items": stats.num_total_items,
                "survivors": stats.survivors,
                "duplicates": stats.duplicates,
            })
        );
        totals.num_total_items = stats.num_total_items;
        totals.survivors += stats.survivors;
        totals.duplicates += stats.duplicates;
        pbar.inc(1);
    }
    pbar.finish_and_clear();

    if let Some(sink) = sink.as_mut() {
        sink.flush().context("failed to flush the duplicate sink")?;
    }

    info!(
        "Result: {}",
        serde_json::json!({
            "num_groups": sources.len(),
            "num_buckets": end - begin,
            "num_total_items": totals.num_total_items,
            "survivors": totals.survivors,
            "duplicates": totals.duplicates,
            "seconds": sw.elapsed().as_secs_f64(),
        })
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(record: &[u8], source: usize) -> MergeEntry {
        MergeEntry {
            record: record.to_vec(),
            source,
        }
    }

    #[test]
    fn heap_pops_smallest_record_first() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(&[0x03, 0, 0], 0));
        heap.push(entry(&[0x01, 0, 7], 1));
        heap.push(entry(&[0x02, 0, 1], 2));

        let order: Vec<u8> = std::iter::from_fn(|| heap.pop().map(|e| e.record[0])).collect();
        assert_eq!(order, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn heap_breaks_record_ties_on_trailer_bytes() {
        // Same bucket byte, different trailers: the smaller trailer wins.
        let mut heap = BinaryHeap::new();
        heap.push(entry(&[0x02, 0, 9], 0));
        heap.push(entry(&[0x02, 0, 4], 1));

        let first = heap.pop().unwrap();
        assert_eq!(first.record, vec![0x02, 0, 4]);
        assert_eq!(first.source, 1);
    }

    #[test]
    fn merge_fails_on_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent").to_str().unwrap().to_string();
        let out = dir.path().join("merged").to_str().unwrap().to_string();
        assert!(matches!(
            merge_bucket(&[missing], &out, 0, None),
            Err(Error::IoOpen { .. })
        ));
    }

    #[test]
    fn merge_fails_on_record_geometry_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a").to_str().unwrap().to_string();
        let b = dir.path().join("b").to_str().unwrap().to_string();

        let mut writer = IndexWriter::create(&a, 0, 4, 1, 1).unwrap();
        writer.write_item(0, 0, &[1, 2, 3, 4]).unwrap();
        writer.close().unwrap();

        let mut writer = IndexWriter::create(&b, 0, 8, 1, 1).unwrap();
        writer.write_item(1, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        writer.close().unwrap();

        let out = dir.path().join("merged").to_str().unwrap().to_string();
        assert!(matches!(
            merge_bucket(&[a, b], &out, 0, None),
            Err(Error::BadHeader { .. })
        ));
    }
}
