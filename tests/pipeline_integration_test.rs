use std::path::Path;

use anyhow::Result;

use neardup::dedup::run_dedup;
use neardup::filter::run_filter_whole;
use neardup::flags::{load_flags, SourceManifest};
use neardup::index::IndexWriter;
use neardup::merge::merge_bucket;

// Use the shared test utilities
mod common;

fn dedup_signature_files(
    dir: &Path,
    basename: &str,
    rows_per_file: &[&[Vec<u32>]],
    h: u32,
    begin: u32,
    end: u32,
) -> Result<String> {
    let mut paths = Vec::new();
    for (k, rows) in rows_per_file.iter().enumerate() {
        let path = dir.join(format!("shard{k}.mh"));
        common::write_signature_file(&path, h, begin, end, rows);
        paths.push(path.to_str().unwrap().to_string());
    }
    let basename = dir.join(basename).to_str().unwrap().to_string();
    run_dedup(paths, &basename, 0, false, false)?;
    Ok(basename)
}

#[test]
fn identity_no_collisions() -> Result<()> {
    // Three distinct one-letter documents, one n-gram each: nothing collides.
    let dir = tempfile::tempdir()?;
    let rows = common::signature_rows_for_texts(&["A", "B", "C"], 1, 2, 0, 1);
    let basename = dedup_signature_files(dir.path(), "out", &[rows.as_slice()], 2, 0, 1)?;

    let flags = load_flags(&dir.path().join("out.dup"))?;
    assert_eq!(flags, b"   ");

    let records = common::read_index(&basename, 0);
    assert_eq!(records.len(), 3);
    let mut iids: Vec<u64> = records.iter().map(|r| r.iid).collect();
    iids.sort_unstable();
    assert_eq!(iids, vec![0, 1, 2]);
    common::assert_strictly_sorted(&common::read_raw_records(&basename, 0));
    Ok(())
}

#[test]
fn exact_duplicate_is_flagged() -> Result<()> {
    // Items 0 and 1 carry identical text, so every bucket collides; the
    // smaller ordinal is the canonical survivor.
    let dir = tempfile::tempdir()?;
    let rows = common::signature_rows_for_texts(&["abcdef", "abcdef", "xyzuvw"], 5, 2, 0, 1);
    assert_eq!(rows[0], rows[1]);
    assert_ne!(rows[0], rows[2]);

    let basename = dedup_signature_files(dir.path(), "out", &[rows.as_slice()], 2, 0, 1)?;

    let flags = load_flags(&dir.path().join("out.dup"))?;
    assert_eq!(flags, b" D ");

    let records = common::read_index(&basename, 0);
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r.iid == 0));
    assert!(records.iter().all(|r| r.iid != 1));
    Ok(())
}

#[test]
fn band_collision_marks_across_passes() -> Result<()> {
    // Bucket 0 groups items 0 and 2; bucket 1 groups items 1 and 2. Item 2
    // dies in the first pass and stays dead; item 1 survives because the
    // first entry of its run has the smaller ordinal.
    let dir = tempfile::tempdir()?;
    let rows: Vec<Vec<u32>> = vec![vec![5, 1], vec![7, 9], vec![5, 9]];
    let basename = dedup_signature_files(dir.path(), "out", &[rows.as_slice()], 1, 0, 2)?;

    let flags = load_flags(&dir.path().join("out.dup"))?;
    assert_eq!(flags, b"  D");

    // Pass 0: item 2 is marked, so only items 0 and 1 are indexed.
    let bucket0 = common::read_index(&basename, 0);
    let mut iids0: Vec<u64> = bucket0.iter().map(|r| r.iid).collect();
    iids0.sort_unstable();
    assert_eq!(iids0, vec![0, 1]);

    // Pass 1: item 2 is re-marked within the pass and skipped again.
    let bucket1 = common::read_index(&basename, 1);
    let mut iids1: Vec<u64> = bucket1.iter().map(|r| r.iid).collect();
    iids1.sort_unstable();
    assert_eq!(iids1, vec![0, 1]);
    Ok(())
}

#[test]
fn global_ordinals_follow_manifest_order() -> Result<()> {
    // The same bucket value in two different shards: the survivor is the
    // item of the earlier shard because ordinals concatenate in list order.
    let dir = tempfile::tempdir()?;
    let shard_a: Vec<Vec<u32>> = vec![vec![100], vec![200]];
    let shard_b: Vec<Vec<u32>> = vec![vec![300], vec![100]];
    let basename = dedup_signature_files(dir.path(), "out", &[shard_a.as_slice(), shard_b.as_slice()], 1, 0, 1)?;

    // Item 3 (= shard_b ordinal 1) duplicates item 0.
    let flags = load_flags(&dir.path().join("out.dup"))?;
    assert_eq!(flags, b"   D");

    let manifest = SourceManifest::load(&dir.path().join("out.src"))?;
    assert_eq!(manifest.group, Some(0));
    assert_eq!(manifest.total_items(), 4);
    assert_eq!(manifest.entries[0].num_items, 2);

    let records = common::read_index(&basename, 0);
    let survivor = records.iter().find(|r| r.bucket == vec![0, 0, 0, 100]);
    assert_eq!(survivor.map(|r| r.iid), Some(0));
    Ok(())
}

#[test]
fn dedup_is_deterministic_across_runs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let rows = common::signature_rows_for_texts(
        &[
            "the quick brown fox jumps over the lazy dog",
            "the quick brown fox jumps over the lazy dog",
            "an entirely different document about rust",
            "the quick brown fox jumps over the lazy dog!",
        ],
        5,
        4,
        0,
        3,
    );

    let first = dedup_signature_files(dir.path(), "first", &[rows.as_slice()], 4, 0, 3)?;
    let second = dedup_signature_files(dir.path(), "second", &[rows.as_slice()], 4, 0, 3)?;

    assert_eq!(
        std::fs::read(format!("{first}.dup"))?,
        std::fs::read(format!("{second}.dup"))?
    );
    for bucket in 0..3 {
        assert_eq!(
            common::read_raw_records(&first, bucket),
            common::read_raw_records(&second, bucket)
        );
        common::assert_strictly_sorted(&common::read_raw_records(&first, bucket));
    }
    Ok(())
}

#[test]
fn flags_accumulate_monotonically_on_resume() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let rows: Vec<Vec<u32>> = vec![vec![5, 1], vec![7, 9], vec![5, 9]];
    let basename = dedup_signature_files(dir.path(), "out", &[rows.as_slice()], 1, 0, 2)?;
    let flags_first = load_flags(&dir.path().join("out.dup"))?;

    // A second run resumes from the saved flags; nothing may come back alive.
    let paths = vec![dir.path().join("shard0.mh").to_str().unwrap().to_string()];
    run_dedup(paths, &basename, 0, true, false)?;
    let flags_second = load_flags(&dir.path().join("out.dup"))?;

    assert_eq!(flags_first, flags_second);
    Ok(())
}

#[test]
fn cross_group_merge_keeps_smallest_trailer() -> Result<()> {
    // Group 0 indexes buckets [0x01, 0x02]; group 1 indexes [0x02, 0x03].
    // The shared bucket 0x02 must be represented by group 0's record.
    let dir = tempfile::tempdir()?;
    let g0 = dir.path().join("g0").to_str().unwrap().to_string();
    let g1 = dir.path().join("g1").to_str().unwrap().to_string();

    let mut writer = IndexWriter::create(&g0, 0, 1, 2, 2)?;
    writer.write_item(0, 0, &[0x01])?;
    writer.write_item(0, 1, &[0x02])?;
    writer.close()?;

    let mut writer = IndexWriter::create(&g1, 0, 1, 2, 2)?;
    writer.write_item(1, 0, &[0x02])?;
    writer.write_item(1, 1, &[0x03])?;
    writer.close()?;

    let out = dir.path().join("merged").to_str().unwrap().to_string();
    let mut sink = Vec::new();
    let stats = merge_bucket(
        &[g0, g1],
        &out,
        0,
        Some(&mut sink as &mut dyn std::io::Write),
    )?;
    assert_eq!(stats.num_total_items, 4);
    assert_eq!(stats.survivors, 3);
    assert_eq!(stats.duplicates, 1);

    let records = common::read_index(&out, 0);
    let summary: Vec<(Vec<u8>, u16, u64)> = records
        .iter()
        .map(|r| (r.bucket.clone(), r.gid, r.iid))
        .collect();
    assert_eq!(
        summary,
        vec![
            (vec![0x01], 0, 0),
            (vec![0x02], 0, 1),
            (vec![0x03], 1, 1),
        ]
    );
    common::assert_strictly_sorted(&common::read_raw_records(&out, 0));

    // The eliminated record is group 1's copy of bucket 0x02.
    assert_eq!(String::from_utf8(sink).unwrap(), "1\t0\n");
    Ok(())
}

#[test]
fn merging_one_group_is_the_identity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let rows = common::signature_rows_for_texts(&["aaaaa bbbbb", "ccccc ddddd"], 5, 2, 0, 1);
    let basename = dedup_signature_files(dir.path(), "solo", &[rows.as_slice()], 2, 0, 1)?;

    let out = dir.path().join("merged").to_str().unwrap().to_string();
    let stats = merge_bucket(&[basename.clone()], &out, 0, None)?;
    assert_eq!(stats.duplicates, 0);
    assert_eq!(
        common::read_raw_records(&basename, 0),
        common::read_raw_records(&out, 0)
    );
    Ok(())
}

#[test]
fn end_to_end_filter_drops_duplicates() -> Result<()> {
    // signature rows -> dedup -> filter-whole, all in one tempdir.
    let dir = tempfile::tempdir()?;
    let texts = [
        "a first document that is long enough",
        "a second document that differs from it",
        "a first document that is long enough",
    ];
    let rows = common::signature_rows_for_texts(&texts, 5, 4, 0, 2);
    dedup_signature_files(dir.path(), "out", &[rows.as_slice()], 4, 0, 2)?;

    let input: String = texts
        .iter()
        .map(|t| format!("{{\"text\": \"{t}\"}}\n"))
        .collect();
    let mut output = Vec::new();
    let kept = run_filter_whole(
        &dir.path().join("out.dup"),
        std::io::Cursor::new(input),
        &mut output,
    )?;
    assert_eq!(kept, 2);

    let lines: Vec<&str> = std::str::from_utf8(&output)?.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("a first document"));
    assert!(lines[1].contains("a second document"));
    Ok(())
}
