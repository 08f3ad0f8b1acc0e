// Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::path::Path;

use neardup::index::{unpack_trailer, IndexReader, TRAILER_BYTES};
use neardup::minhash::{char_ngrams, signature_row};
use neardup::store::SignatureWriter;

/// Write a signature file from explicit hash rows. Each row holds the
/// `end - begin` bucket rows of one item, `h` values per bucket.
pub fn write_signature_file(path: &Path, h: u32, begin: u32, end: u32, rows: &[Vec<u32>]) {
    let mut writer = SignatureWriter::create(path, h, begin, end).unwrap();
    for row in rows {
        writer.put(row).unwrap();
    }
    writer.close().unwrap();
}

/// Compute real signature rows for a set of documents.
pub fn signature_rows_for_texts(
    texts: &[&str],
    ngram: usize,
    h: u32,
    begin: u32,
    end: u32,
) -> Vec<Vec<u32>> {
    texts
        .iter()
        .map(|text| {
            let features = char_ngrams(text, ngram);
            let mut row = vec![0u32; ((end - begin) * h) as usize];
            signature_row(&features, begin, end, h, &mut row);
            row
        })
        .collect()
}

/// A decoded index record: bucket bytes plus the (group, item) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub bucket: Vec<u8>,
    pub gid: u16,
    pub iid: u64,
}

/// Read all records of `<basename>.idx.NNNNN`, checking that the header's
/// active count matches the record stream.
pub fn read_index(basename: &str, bucket: u32) -> Vec<IndexRecord> {
    let mut reader = IndexReader::open(basename, bucket).unwrap();
    let mut records = Vec::new();
    let mut buf = vec![0u8; reader.record_len()];
    while reader.next_record(&mut buf).unwrap() {
        let w = buf.len() - TRAILER_BYTES;
        let (gid, iid) = unpack_trailer(buf[w..].try_into().unwrap());
        records.push(IndexRecord {
            bucket: buf[..w].to_vec(),
            gid,
            iid,
        });
    }
    assert_eq!(records.len() as u64, reader.num_active_items);
    records
}

/// Raw record bytes of an index file, for sortedness and byte-equality checks.
pub fn read_raw_records(basename: &str, bucket: u32) -> Vec<Vec<u8>> {
    let mut reader = IndexReader::open(basename, bucket).unwrap();
    let mut records = Vec::new();
    let mut buf = vec![0u8; reader.record_len()];
    while reader.next_record(&mut buf).unwrap() {
        records.push(buf.clone());
    }
    records
}

/// Assert that records are strictly increasing on their full byte strings.
pub fn assert_strictly_sorted(records: &[Vec<u8>]) {
    for pair in records.windows(2) {
        assert!(pair[0] < pair[1], "records out of order: {pair:?}");
    }
}
