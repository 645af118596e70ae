//! The merge-and-sort compiler (C3): turns a batch of raw traces plus
//! per-trace cutoffs into one compiled trace.

use crate::codec::{read_raw_trace, ProtoFtraceEvent, ProtoTrace};
use crate::resolver::InodeResolver;
use iorap_core::error::{IorapError, Result};
use iorap_core::inode::InodeKey;
use iorap_core::trace::{merge_dedup, sort_for_playback, CompiledTrace, CompilerEntry};
use regex::Regex;
use std::path::PathBuf;

#[derive(Debug)]
pub struct CompilationInput {
    pub raw_trace_path: PathBuf,
    /// Absolute timestamp cutoff, inclusive. `None` means no cutoff.
    pub timestamp_limit_ns: Option<u64>,
}

/// Zips `input_file_names` with `timestamp_limit_ns`, per §4.3's
/// `MakeCompilationInputs`. An empty `timestamp_limit_ns` list means no
/// trace has a cutoff; otherwise the two lists must be the same length.
pub fn make_compilation_inputs(
    input_file_names: Vec<PathBuf>,
    timestamp_limit_ns: Vec<u64>,
) -> Result<Vec<CompilationInput>> {
    if !timestamp_limit_ns.is_empty() && timestamp_limit_ns.len() != input_file_names.len() {
        return Err(IorapError::bad_input(format!(
            "{} input files but {} timestamp limits",
            input_file_names.len(),
            timestamp_limit_ns.len()
        )));
    }
    Ok(input_file_names
        .into_iter()
        .enumerate()
        .map(|(i, path)| CompilationInput {
            raw_trace_path: path,
            timestamp_limit_ns: timestamp_limit_ns.get(i).copied(),
        })
        .collect())
}

struct LoadedEvent {
    inode: InodeKey,
    timestamp_relative: u64,
    add_to_page_cache: bool,
    page_index: u64,
}

/// Step 1: one raw trace → its filtered, relative-timestamped events.
fn load_and_filter(input: &CompilationInput) -> Result<Vec<LoadedEvent>> {
    let trace: ProtoTrace = read_raw_trace(&input.raw_trace_path)?;
    let limit = input.timestamp_limit_ns.unwrap_or(u64::MAX);
    let min_ts = start_timestamp(&trace);

    let mut raw_events = Vec::new();
    for packet in &trace.packet {
        let packet_ts = packet.timestamp;
        let Some(bundle) = &packet.ftrace_events else {
            continue;
        };
        for event in &bundle.event {
            let ts = event.timestamp.or(packet_ts).unwrap_or(0);
            if ts > limit {
                continue;
            }
            if let Some((inode, page_index, add)) = classify(event) {
                raw_events.push((ts, inode, page_index, add));
            }
        }
    }

    Ok(raw_events
        .into_iter()
        .map(|(ts, inode, page_index, add_to_page_cache)| LoadedEvent {
            inode,
            timestamp_relative: ts.saturating_sub(min_ts),
            add_to_page_cache,
            page_index,
        })
        .collect())
}

/// The minimum timestamp across every packet and ftrace event in the
/// *entire* trace, computed before the cutoff and page-cache-classify
/// filters run — matching `GetStartTimestamp`, which takes this baseline
/// over the raw trace so a trace's relative timestamps stay anchored even
/// when its earliest events get filtered out downstream.
fn start_timestamp(trace: &ProtoTrace) -> u64 {
    let mut min_ts: Option<u64> = None;
    let mut update = |ts: u64| {
        min_ts = Some(min_ts.map_or(ts, |m| m.min(ts)));
    };
    for packet in &trace.packet {
        if let Some(ts) = packet.timestamp {
            update(ts);
        }
        let Some(bundle) = &packet.ftrace_events else {
            continue;
        };
        for event in &bundle.event {
            if let Some(ts) = event.timestamp {
                update(ts);
            }
        }
    }
    min_ts.unwrap_or(0)
}

fn classify(event: &ProtoFtraceEvent) -> Option<(InodeKey, u64, bool)> {
    if let Some(add) = &event.mm_filemap_add_to_page_cache {
        let ino = add.i_ino?;
        let dev = add.s_dev.unwrap_or(0);
        let index = add.index.unwrap_or(0);
        return Some((InodeKey::from_dev_ino(dev, ino), index, true));
    }
    if let Some(del) = &event.mm_filemap_delete_from_page_cache {
        let ino = del.i_ino?;
        let dev = del.s_dev.unwrap_or(0);
        let index = del.index.unwrap_or(0);
        return Some((InodeKey::from_dev_ino(dev, ino), index, false));
    }
    None
}

pub struct CompileOptions<'a> {
    pub resolver: &'a InodeResolver,
    pub blacklist_filter: Option<&'a Regex>,
}

/// Runs the full §4.3 pipeline and returns the merged, playback-sorted
/// entries — the shape both the proto emitter and the text emitter build
/// from (§4.3 step 5, before step 6's binary-only id assignment).
pub fn compile_entries(inputs: &[CompilationInput], options: &CompileOptions) -> Result<Vec<CompilerEntry>> {
    let mut loaded = Vec::new();
    for input in inputs {
        loaded.push(load_and_filter(input)?);
    }

    let distinct_inodes: Vec<InodeKey> = {
        let mut set = std::collections::HashSet::new();
        for events in &loaded {
            for e in events {
                set.insert(e.inode);
            }
        }
        set.into_iter().collect()
    };
    let resolved: std::collections::HashMap<InodeKey, iorap_core::inode::ResolveResult> =
        options.resolver.resolve(&distinct_inodes)?.into_iter().collect();

    let mut entries = Vec::new();
    for events in loaded {
        for e in events {
            let path = match resolved.get(&e.inode) {
                Some(Ok(path)) => path,
                Some(Err(kind)) => {
                    log::warn!("dropping event: inode {} did not resolve ({kind})", e.inode.inode);
                    continue;
                }
                None => {
                    log::warn!("dropping event: inode {} did not resolve", e.inode.inode);
                    continue;
                }
            };
            if let Some(re) = options.blacklist_filter {
                if re.is_match(path) {
                    continue;
                }
            }
            entries.push(CompilerEntry {
                file_path: path.clone(),
                timestamp_relative: e.timestamp_relative,
                add_to_page_cache: e.add_to_page_cache,
                page_index: e.page_index,
            });
        }
    }

    let merged = merge_dedup(entries);
    Ok(sort_for_playback(merged))
}

/// Convenience wrapper producing the binary `index`/`list` form directly.
pub fn compile(inputs: &[CompilationInput], options: &CompileOptions) -> Result<CompiledTrace> {
    let sorted = compile_entries(inputs, options)?;
    Ok(CompiledTrace::from_sorted_entries(&sorted))
}

/// Diagnostic text rendering, one line per emitted event, matching the
/// format emitted by the original compiler's `--output-text` mode. Takes
/// the merged-and-sorted entries directly since the binary `index`/`list`
/// form has already dropped the timestamp the text form displays.
pub fn render_text(sorted_entries: &[CompilerEntry]) -> String {
    let mut out = String::new();
    for entry in sorted_entries.iter().filter(|e| e.add_to_page_cache) {
        out.push_str(&format!(
            "{{filename:\"{}\",timestamp:{},add_to_page_cache:1,index:{}}}\n",
            entry.file_path, entry.timestamp_relative, entry.page_index
        ));
    }
    out
}
