// MinHash signature generation from JSONL documents.
//
// Features are n-grams of Unicode scalar values taken from the raw text
// field. Hash function #k is murmur3 (x86, 32-bit) seeded with k, so bucket
// b draws its H values from functions b*H .. b*H+H and every shard computes
// identical signatures for identical text.

use std::io::{BufRead, Cursor};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::info;

use crate::common::open_jsonl_input;
use crate::store::SignatureWriter;

/// Extract all n-grams of `n` Unicode scalar values from `text`. A text of
/// `L >= n` characters yields `L - n + 1` n-grams; shorter text yields none.
pub fn char_ngrams(text: &str, n: usize) -> Vec<&str> {
    // Byte offset of every character boundary, including the end.
    let mut bounds: Vec<usize> = text.char_indices().map(|(at, _)| at).collect();
    bounds.push(text.len());

    (0..bounds.len().saturating_sub(n))
        .map(|i| &text[bounds[i]..bounds[i + n]])
        .collect()
}

/// Fill `out` with the MinHash values of hash functions `seed_base ..
/// seed_base + out.len()` over `features`.
pub fn minhash_row(features: &[&str], seed_base: u32, out: &mut [u32]) {
    for (k, slot) in out.iter_mut().enumerate() {
        let seed = seed_base + k as u32;
        let mut min = u32::MAX;
        for feature in features {
            let hash = murmur3::murmur3_32(&mut Cursor::new(feature.as_bytes()), seed).unwrap_or(0);
            if hash < min {
                min = hash;
            }
        }
        *slot = min;
    }
}

/// Compute the bucket rows `begin..end` for one document, `h` hash values
/// per bucket, laid out back to back in `out`.
pub fn signature_row(features: &[&str], begin: u32, end: u32, h: u32, out: &mut [u32]) {
    debug_assert_eq!(out.len(), ((end - begin) * h) as usize);
    for (row, bucket) in out.chunks_exact_mut(h as usize).zip(begin..end) {
        minhash_row(features, bucket * h, row);
    }
}

/// Read JSONL documents and write their MinHash signature file.
pub fn execute_signature(
    ngram: usize,
    num_hash_values: u32,
    begin: u32,
    end: u32,
    text_field: &str,
    input: Option<&Path>,
    output: &Path,
) -> Result<()> {
    if ngram == 0 {
        return Err(anyhow!("n-gram size must be at least 1"));
    }

    let reader = open_jsonl_input(input)?;
    let mut writer = SignatureWriter::create(output, num_hash_values, begin, end)?;

    // Documents with a missing, non-string, or too-short text field are
    // hashed as n underscores so every item still has a valid signature.
    let placeholder = "_".repeat(ngram);
    let mut row = vec![0u32; ((end - begin) * num_hash_values) as usize];

    for (line_number, line) in reader.lines().enumerate() {
        let line = line.context("failed to read an input line")?;
        let document: Value = serde_json::from_str(&line)
            .with_context(|| format!("invalid JSON on line {}", line_number + 1))?;

        let mut text = document
            .get(text_field)
            .and_then(Value::as_str)
            .unwrap_or(&placeholder);
        if text.chars().count() < ngram {
            text = &placeholder;
        }

        let features = char_ngrams(text, ngram);
        signature_row(&features, begin, end, num_hash_values, &mut row);
        writer.put(&row)?;
    }

    let num_items = writer.close()?;
    info!(
        "Wrote {} signatures ({} buckets x {} hash values) to {}",
        num_items,
        end - begin,
        num_hash_values,
        output.display()
    );
    Ok(())
}
