use anyhow::Context;
use clap::Parser;
use iorap_compiler::{
    codec, compile_entries, compiler::render_text, make_compilation_inputs, CompileOptions,
    DataSource, InodeResolver, VerifyKind,
};
use iorap_core::trace::CompiledTrace;
use regex::Regex;
use std::io::{self, Write};
use std::path::PathBuf;

/// Request a compilation of multiple inputs (format: PerfettoTraceProto).
/// The result is a TraceFile, representing a merged compiled trace with
/// inodes resolved.
#[derive(Parser, Debug)]
#[command(name = "iorap-compiler", disable_help_flag = false)]
struct Args {
    /// TraceFile tracebuffer output file (default stdout).
    #[arg(long = "output-proto", short = 'o', visible_alias = "op")]
    output_proto: Option<PathBuf>,

    /// Output ascii text instead of protobuf (default off).
    #[arg(long = "output-text", visible_alias = "ot")]
    output_text: bool,

    /// Resolve inode->filename from textcache (disables diskscan).
    #[arg(long = "inode-textcache", visible_alias = "it")]
    inode_textcache: Option<PathBuf>,

    /// Specify regex acting as a blacklist filter.
    #[arg(long = "blacklist-filter", visible_alias = "bf")]
    blacklist_filter: Option<String>,

    /// Set the limit timestamp in nanoseconds for the compiled trace. The
    /// order and size must match the input trace files, or be omitted
    /// entirely (meaning no cutoff for any trace).
    #[arg(long = "timestamp_limit_ns", visible_alias = "tl")]
    timestamp_limit_ns: Vec<u64>,

    /// Set verbosity (default off).
    #[arg(long, short)]
    verbose: bool,

    /// Wait for a keystroke before continuing (default off); useful for
    /// attaching a debugger.
    #[arg(long, short)]
    wait: bool,

    /// Raw perfetto trace input files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

const EXIT_OK: i32 = 0;
const EXIT_BAD_ARGS: i32 = 1;
const EXIT_NO_MATCH: i32 = 2;
const EXIT_PIPELINE_ERROR: i32 = 3;

fn main() {
    let args = Args::parse();

    if args.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if args.wait {
        eprintln!("Self pid: {}", std::process::id());
        eprintln!("Press enter to continue...");
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
    }

    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let inputs = match make_compilation_inputs(args.inputs.clone(), args.timestamp_limit_ns.clone()) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_BAD_ARGS;
        }
    };

    let blacklist_filter = match args.blacklist_filter.as_deref().map(Regex::new) {
        Some(Ok(re)) => Some(re),
        Some(Err(e)) => {
            eprintln!("invalid --blacklist-filter: {e}");
            return EXIT_BAD_ARGS;
        }
        None => None,
    };

    let resolver = match &args.inode_textcache {
        Some(path) => InodeResolver::new(
            DataSource::TextCache { path: path.clone() },
            VerifyKind::None,
        ),
        None => {
            log::warn!(
                "--inode-textcache unspecified; resolving inodes by scanning the disk, \
                 which makes compilation non-deterministic."
            );
            InodeResolver::new(
                DataSource::DiskScan {
                    root_directories: vec![
                        "/system".into(),
                        "/apex".into(),
                        "/data".into(),
                        "/vendor".into(),
                        "/product".into(),
                        "/metadata".into(),
                    ],
                },
                VerifyKind::Stat,
            )
        }
    };

    let sorted = match compile_entries(
        &inputs,
        &CompileOptions {
            resolver: &resolver,
            blacklist_filter: blacklist_filter.as_ref(),
        },
    ) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("compilation failed: {e}");
            return EXIT_PIPELINE_ERROR;
        }
    };

    if sorted.is_empty() {
        eprintln!("no events matched; nothing to emit");
        return EXIT_NO_MATCH;
    }

    let write_result = if args.output_text {
        let text = render_text(&sorted);
        write_output(args.output_proto.as_deref(), text.as_bytes())
    } else {
        let trace = CompiledTrace::from_sorted_entries(&sorted);
        let bytes = codec::encode_compiled_trace(&trace);
        write_output(args.output_proto.as_deref(), &bytes)
    };

    match write_result.context("writing compiled trace output") {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("{e:#}");
            EXIT_PIPELINE_ERROR
        }
    }
}

/// Writes the whole buffer atomically via a temp file + rename when a path
/// is given (failure never leaves a half-written output file), or to
/// stdout when it isn't.
fn write_output(path: Option<&std::path::Path>, bytes: &[u8]) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let tmp = tempfile::NamedTempFile::new_in(dir)?;
            std::fs::write(tmp.path(), bytes)?;
            tmp.persist(path)?;
            Ok(())
        }
        None => {
            io::stdout().write_all(bytes)?;
            Ok(())
        }
    }
}
