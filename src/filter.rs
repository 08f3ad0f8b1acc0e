// Stream JSONL documents and drop the ones flagged as duplicates.
//
// The flag file and the input stream advance in lockstep: line i of the
// target shard corresponds to flag byte offset+i, where the offset is the
// shard's window in the concatenation order of the source manifest.

use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::flags::{load_flags, SourceManifest, FLAG_ACTIVE};

fn stdin_path() -> PathBuf {
    PathBuf::from("<stdin>")
}

fn stdout_path() -> PathBuf {
    PathBuf::from("<stdout>")
}

/// Filter one shard: keep input line i iff flag byte `offset + i` is active,
/// where `(offset, size)` is the window of `target` in the manifest. Returns
/// the number of surviving lines.
pub fn run_filter_each(
    flag_path: &Path,
    src_path: &Path,
    target: &str,
    strip_dirs: bool,
    input: impl BufRead,
    mut output: impl Write,
) -> Result<u64> {
    // The flag file length is the total item count of the manifest.
    let mut flag_file = File::open(flag_path).map_err(|source| Error::IoOpen {
        path: flag_path.to_path_buf(),
        source,
    })?;
    let num_total_items = flag_file
        .seek(SeekFrom::End(0))
        .map_err(|source| Error::IoSeek {
            path: flag_path.to_path_buf(),
            source,
        })?;

    let manifest = SourceManifest::load(src_path)?;
    if manifest.total_items() != num_total_items {
        return Err(Error::InconsistentSize {
            reason: format!(
                "flag file {} vs manifest {}",
                flag_path.display(),
                src_path.display()
            ),
            expected: manifest.total_items(),
            actual: num_total_items,
        });
    }

    let (offset, size) = manifest.find_target(target, strip_dirs)?;

    // Only the target's window of the flag file is needed.
    let mut window = vec![0u8; size as usize];
    flag_file
        .seek(SeekFrom::Start(offset))
        .map_err(|source| Error::IoSeek {
            path: flag_path.to_path_buf(),
            source,
        })?;
    flag_file
        .read_exact(&mut window)
        .map_err(|source| Error::IoRead {
            path: flag_path.to_path_buf(),
            source,
        })?;

    debug!(
        "Filtering {target}: offset {offset}, size {size} (flags from {})",
        flag_path.display()
    );

    let mut num_lines = 0u64;
    let mut num_active = 0u64;
    for line in input.lines() {
        let line = line.map_err(|source| Error::IoRead {
            path: stdin_path(),
            source,
        })?;
        if num_lines >= size {
            return Err(Error::InconsistentSize {
                reason: "input stream is longer than the target shard".into(),
                expected: size,
                actual: num_lines + 1,
            });
        }
        if window[num_lines as usize] == FLAG_ACTIVE {
            writeln!(output, "{line}").map_err(|source| Error::IoWrite {
                path: stdout_path(),
                source,
            })?;
            num_active += 1;
        }
        num_lines += 1;
    }
    if num_lines < size {
        return Err(Error::InconsistentSize {
            reason: "input stream is shorter than the target shard".into(),
            expected: size,
            actual: num_lines,
        });
    }

    debug!("Kept {num_active} of {num_lines} lines");
    Ok(num_active)
}

/// Filter a whole concatenated corpus: the input stream must contain exactly
/// one line per flag byte. Returns the number of surviving lines.
pub fn run_filter_whole(
    flag_path: &Path,
    input: impl BufRead,
    mut output: impl Write,
) -> Result<u64> {
    let flags = load_flags(flag_path)?;
    let num_total_items = flags.len() as u64;

    let mut lines = input.lines();
    let mut num_active = 0u64;
    for (i, flag) in flags.iter().enumerate() {
        let Some(line) = lines.next() else {
            return Err(Error::InconsistentSize {
                reason: "input stream ended before the flag file".into(),
                expected: num_total_items,
                actual: i as u64,
            });
        };
        let line = line.map_err(|source| Error::IoRead {
            path: stdin_path(),
            source,
        })?;
        if *flag == FLAG_ACTIVE {
            writeln!(output, "{line}").map_err(|source| Error::IoWrite {
                path: stdout_path(),
                source,
            })?;
            num_active += 1;
        }
    }
    if lines.next().is_some() {
        return Err(Error::InconsistentSize {
            reason: "input stream is longer than the flag file".into(),
            expected: num_total_items,
            actual: num_total_items + 1,
        });
    }

    debug!("Kept {num_active} of {num_total_items} lines");
    Ok(num_active)
}

/// CLI entry for `filter-each`: documents from stdin, survivors to stdout.
pub fn execute_filter_each(
    flag_path: &Path,
    src_path: &Path,
    target: &str,
    strip_dirs: bool,
) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    run_filter_each(
        flag_path,
        src_path,
        target,
        strip_dirs,
        stdin.lock(),
        stdout.lock(),
    )?;
    Ok(())
}

/// CLI entry for `filter-whole`: documents from stdin, survivors to stdout.
pub fn execute_filter_whole(flag_path: &Path) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    run_filter_whole(flag_path, stdin.lock(), stdout.lock())?;
    Ok(())
}
