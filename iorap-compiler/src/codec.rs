//! Trace-file protobuf codec (C1): the compiled-trace wire format and the
//! raw (perfetto-shaped) ftrace trace wire format, both read/written via
//! `mmap` rather than buffered reads — traces can run to tens of MiB and
//! the compiler only ever walks them once, front to back.

use iorap_core::error::{IorapError, Result};
use iorap_core::trace::{CompiledTrace, TraceIndexEntry, TraceListEntry};
use memmap2::Mmap;
use prost::Message;
use std::fs::File;
use std::path::Path;

/// `index` / `list` message pair, §6 "Compiled-trace file format".
#[derive(Clone, PartialEq, Message)]
pub struct ProtoCompiledTrace {
    #[prost(message, repeated, tag = "1")]
    pub index: Vec<ProtoIndexEntry>,
    #[prost(message, repeated, tag = "2")]
    pub list: Vec<ProtoListEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoIndexEntry {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(string, tag = "2")]
    pub file_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoListEntry {
    #[prost(int64, tag = "1")]
    pub index_id: i64,
    #[prost(int64, tag = "2")]
    pub file_offset: i64,
    #[prost(int64, tag = "3")]
    pub file_length: i64,
}

impl From<&CompiledTrace> for ProtoCompiledTrace {
    fn from(trace: &CompiledTrace) -> Self {
        ProtoCompiledTrace {
            index: trace
                .index
                .iter()
                .map(|e| ProtoIndexEntry {
                    id: e.id,
                    file_name: e.file_name.clone(),
                })
                .collect(),
            list: trace
                .list
                .iter()
                .map(|e| ProtoListEntry {
                    index_id: e.index_id,
                    file_offset: e.file_offset_bytes as i64,
                    file_length: e.file_length_bytes as i64,
                })
                .collect(),
        }
    }
}

impl From<ProtoCompiledTrace> for CompiledTrace {
    fn from(proto: ProtoCompiledTrace) -> Self {
        CompiledTrace {
            index: proto
                .index
                .into_iter()
                .map(|e| TraceIndexEntry {
                    id: e.id,
                    file_name: e.file_name,
                })
                .collect(),
            list: proto
                .list
                .into_iter()
                .map(|e| TraceListEntry {
                    index_id: e.index_id,
                    file_offset_bytes: e.file_offset as u64,
                    file_length_bytes: e.file_length as u64,
                })
                .collect(),
        }
    }
}

pub fn encode_compiled_trace(trace: &CompiledTrace) -> Vec<u8> {
    ProtoCompiledTrace::from(trace).encode_to_vec()
}

pub fn decode_compiled_trace(bytes: &[u8]) -> Result<CompiledTrace> {
    let proto = ProtoCompiledTrace::decode(bytes).map_err(|e| IorapError::bad_input(e.to_string()))?;
    Ok(proto.into())
}

pub fn write_compiled_trace(path: &Path, trace: &CompiledTrace) -> Result<()> {
    std::fs::write(path, encode_compiled_trace(trace))?;
    Ok(())
}

pub fn read_compiled_trace(path: &Path) -> Result<CompiledTrace> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    decode_compiled_trace(&mmap)
}

/// Same as [`read_compiled_trace`] but for a descriptor already open, the
/// shape `CreateFdSession` hands off (§4.4): the fd arrives out-of-band over
/// `SCM_RIGHTS` with no path attached. Takes ownership of `fd` the way
/// `File::from_raw_fd` always does — the caller must not use it afterwards.
#[cfg(unix)]
pub fn decode_compiled_trace_from_fd(fd: std::os::fd::RawFd) -> Result<CompiledTrace> {
    use std::os::fd::FromRawFd;
    let file = unsafe { File::from_raw_fd(fd) };
    let mmap = unsafe { Mmap::map(&file)? };
    decode_compiled_trace(&mmap)
}

// -- raw (perfetto-shaped) trace format, consumed opaquely per §6 --------

#[derive(Clone, PartialEq, Message)]
pub struct ProtoTrace {
    #[prost(message, repeated, tag = "1")]
    pub packet: Vec<ProtoTracePacket>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoTracePacket {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(message, optional, tag = "2")]
    pub ftrace_events: Option<ProtoFtraceEventBundle>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoFtraceEventBundle {
    #[prost(uint32, optional, tag = "1")]
    pub cpu: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub event: Vec<ProtoFtraceEvent>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoFtraceEvent {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(message, optional, tag = "2")]
    pub mm_filemap_add_to_page_cache: Option<ProtoPageCacheEvent>,
    #[prost(message, optional, tag = "3")]
    pub mm_filemap_delete_from_page_cache: Option<ProtoPageCacheEvent>,
}

/// Any field may be absent on a given device (§4.2).
#[derive(Clone, PartialEq, Message)]
pub struct ProtoPageCacheEvent {
    #[prost(uint64, optional, tag = "1")]
    pub pfn: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub i_ino: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub index: Option<u64>,
    #[prost(uint64, optional, tag = "4")]
    pub s_dev: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub page: Option<u64>,
}

pub fn read_raw_trace(path: &Path) -> Result<ProtoTrace> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    ProtoTrace::decode(&mmap[..]).map_err(|e| IorapError::bad_input(e.to_string()))
}

pub fn encode_raw_trace(trace: &ProtoTrace) -> Vec<u8> {
    trace.encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use iorap_core::trace::{CompiledTrace, TraceIndexEntry, TraceListEntry};

    #[test]
    fn compiled_trace_roundtrips_through_bytes() {
        let trace = CompiledTrace {
            index: vec![TraceIndexEntry {
                id: 0,
                file_name: "/a/b".to_string(),
            }],
            list: vec![TraceListEntry {
                index_id: 0,
                file_offset_bytes: 4096,
                file_length_bytes: 4096,
            }],
        };
        let bytes = encode_compiled_trace(&trace);
        let decoded = decode_compiled_trace(&bytes).unwrap();
        assert_eq!(decoded, trace);
    }

    #[test]
    fn compiled_trace_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compiled_trace.pb");
        let trace = CompiledTrace::new();
        write_compiled_trace(&path, &trace).unwrap();
        let decoded = read_compiled_trace(&path).unwrap();
        assert_eq!(decoded, trace);
    }

    #[test]
    fn raw_trace_roundtrips() {
        let trace = ProtoTrace {
            packet: vec![ProtoTracePacket {
                timestamp: Some(1000),
                ftrace_events: Some(ProtoFtraceEventBundle {
                    cpu: Some(0),
                    event: vec![ProtoFtraceEvent {
                        timestamp: Some(1000),
                        mm_filemap_add_to_page_cache: Some(ProtoPageCacheEvent {
                            pfn: None,
                            i_ino: Some(42),
                            index: Some(1),
                            s_dev: Some(0x0801),
                            page: None,
                        }),
                        mm_filemap_delete_from_page_cache: None,
                    }],
                }),
            }],
        };
        let bytes = encode_raw_trace(&trace);
        let decoded = ProtoTrace::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, trace);
    }

    #[test]
    fn malformed_bytes_are_bad_input() {
        let err = decode_compiled_trace(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, IorapError::BadInput(_)));
    }
}
