// External crates
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

// Standard library
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

// Internal crate imports
use neardup::dedup::execute_dedup;
use neardup::filter::{execute_filter_each, execute_filter_whole};
use neardup::merge::execute_merge;
use neardup::minhash::execute_signature;

/*=================================================================
=                                  ARGS                           =
=================================================================*/

#[derive(Parser)]
#[clap(
    author,
    version,
    about = "Neardup - near-duplicate detection for large JSONL corpora",
    long_about = "Neardup flags near-duplicate documents in sharded JSONL corpora with MinHash + LSH banding.\n\nThe pipeline has four stages:\n- signature: compute per-document MinHash signature files\n- dedup: deduplicate items within one group and build bucket indices\n- merge: merge bucket indices across groups\n- filter-each / filter-whole: stream documents and drop the flagged ones"
)]
struct ArgParser {
    #[clap(subcommand)]
    command: Commands,

    /// Worker threads for parallel phases (0 = one per core)
    #[arg(long, default_value_t = 0)]
    threads: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read JSONL documents and write their MinHash signature file
    Signature {
        /// Number of letters of an n-gram
        #[arg(short = 'n', long, default_value_t = 5)]
        ngram: usize,

        /// Number of hash values per bucket
        #[arg(short = 'b', long = "bucket", default_value_t = 20)]
        bucket: u32,

        /// Start number of buckets
        #[arg(short = 's', long, default_value_t = 0)]
        start: u32,

        /// End number of buckets (number of buckets when START = 0)
        #[arg(short = 'r', long, default_value_t = 40)]
        end: u32,

        /// Text field in JSON
        #[arg(short = 't', long, default_value = "text")]
        text: String,

        /// Read documents from a file (.jsonl, .jsonl.gz, .jsonl.zst) instead of stdin
        #[arg(short = 'i', long)]
        input: Option<PathBuf>,

        /// Filename where MinHash buckets will be stored
        filename: PathBuf,
    },

    /// Deduplicate items within one group and build bucket indices
    /// (signature file paths are read from stdin, one per line)
    Dedup {
        /// Unique group number in the range [0, 65535]
        #[arg(short = 'g', long)]
        group: u64,

        /// Do not save index files after deduplication
        #[arg(short = 'n', long)]
        no_index: bool,

        /// Ignore an existing flag file to cold-start deduplication
        #[arg(long)]
        ignore_flag: bool,

        /// Log level for the console
        #[arg(long, default_value = "warning")]
        log_level_console: String,

        /// Log level for file logging ({BASENAME}.log)
        #[arg(long, default_value = "info")]
        log_level_file: String,

        /// Basename for output files (index, flag, source list, log)
        basename: String,
    },

    /// Merge bucket indices to deduplicate items across groups
    Merge {
        /// Start number of buckets
        #[arg(short = 's', long, default_value_t = 0)]
        start: u32,

        /// End number of buckets (number of buckets when START = 0)
        #[arg(short = 'r', long, default_value_t = 40)]
        end: u32,

        /// Basename for merged index ({OUT}.idx.NNNNN) and log files
        #[arg(short = 'o', long)]
        output: String,

        /// Append eliminated "<group>\t<item>" pairs to this file
        #[arg(long)]
        duplicates: Option<PathBuf>,

        /// Log level for the console
        #[arg(long, default_value = "warning")]
        log_level_console: String,

        /// Log level for file logging ({OUT}.log)
        #[arg(long, default_value = "info")]
        log_level_file: String,

        /// Basenames of the per-group index files (.idx.NNNNN)
        #[arg(required = true)]
        sources: Vec<String>,
    },

    /// Read one shard's JSONL from stdin and output non-duplicate lines
    FilterEach {
        /// Flag file marking duplicated documents with 'D'
        #[arg(short = 'f', long)]
        flag: PathBuf,

        /// File storing the list of source MinHash files for the flag file
        #[arg(short = 's', long)]
        source: PathBuf,

        /// Strip directory names from source paths when finding the target
        #[arg(short = 'd', long)]
        strip: bool,

        /// MinHash filename corresponding to the input JSONL file
        /// (this file does not need to exist)
        target: String,
    },

    /// Read a whole concatenated corpus from stdin and output non-duplicate lines
    FilterWhole {
        /// Flag file marking duplicated documents with 'D'
        #[arg(short = 'f', long)]
        flag: PathBuf,
    },
}

/*=================================================================
=                               LOGGING                           =
=================================================================*/

fn translate_log_level(level: &str) -> Result<LevelFilter> {
    match level {
        "off" => Ok(LevelFilter::OFF),
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        // The coarsest level tracing offers; critical messages map here.
        "critical" => Ok(LevelFilter::ERROR),
        other => Err(anyhow::anyhow!("unknown log level: {other}")),
    }
}

// Console output goes to stderr: the filter subcommands stream surviving
// documents on stdout.
fn init_logging(console_level: &str, file: Option<(&str, &str)>) -> Result<()> {
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(translate_log_level(console_level)?);

    match file {
        Some((level, path)) => {
            let file = File::create(path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(translate_log_level(level)?);
            tracing_subscriber::registry()
                .with(console)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry().with(console).init();
        }
    }
    Ok(())
}

/*=================================================================
=                                 MAIN                            =
=================================================================*/

fn run(args: &ArgParser) -> Result<()> {
    match &args.command {
        Commands::Signature {
            ngram,
            bucket,
            start,
            end,
            text,
            input,
            filename,
        } => {
            init_logging("info", None)?;
            execute_signature(
                *ngram,
                *bucket,
                *start,
                *end,
                text,
                input.as_deref(),
                filename,
            )
        }

        Commands::Dedup {
            group,
            no_index,
            ignore_flag,
            log_level_console,
            log_level_file,
            basename,
        } => {
            init_logging(
                log_level_console,
                Some((log_level_file, &format!("{basename}.log"))),
            )?;
            execute_dedup(basename, *group, *no_index, *ignore_flag)
        }

        Commands::Merge {
            start,
            end,
            output,
            duplicates,
            log_level_console,
            log_level_file,
            sources,
        } => {
            init_logging(
                log_level_console,
                Some((log_level_file, &format!("{output}.log"))),
            )?;
            execute_merge(sources, output, *start, *end, duplicates.as_deref())
        }

        Commands::FilterEach {
            flag,
            source,
            strip,
            target,
        } => {
            init_logging("warning", None)?;
            execute_filter_each(flag, source, target, *strip)
        }

        Commands::FilterWhole { flag } => {
            init_logging("warning", None)?;
            execute_filter_whole(flag)
        }
    }
}

fn main() {
    let args = ArgParser::parse();
    if args.threads != 0 {
        std::env::set_var("RAYON_NUM_THREADS", args.threads.to_string());
    }

    // Every error is fatal: report once and exit non-zero.
    if let Err(err) = run(&args) {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
}
