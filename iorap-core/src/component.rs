//! `(package, activity, version)` identity and its on-disk layout key.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedComponentName {
    pub package: String,
    pub activity: String,
    pub version: i64,
}

impl VersionedComponentName {
    pub fn new(package: impl Into<String>, activity: impl Into<String>, version: i64) -> Self {
        Self {
            package: package.into(),
            activity: activity.into(),
            version,
        }
    }

    /// Canonicalize an intent's `(package, class)` pair the way
    /// `AppComponentName::FromIntentArgument` does: a class starting with
    /// `.` is relative to the package; a bare (unqualified) class name
    /// with no dot at all is too. A class containing a dot anywhere else
    /// is assumed fully-qualified already.
    pub fn canonicalize_activity(package: &str, class_name: &str) -> String {
        if let Some(stripped) = class_name.strip_prefix('.') {
            format!("{package}.{stripped}")
        } else if !class_name.contains('.') {
            format!("{package}.{class_name}")
        } else {
            class_name.to_string()
        }
    }

    /// Root directory for this component's raw traces:
    /// `<root>/<package>/<version>/<activity>/raw_traces/`.
    pub fn raw_traces_dir(&self, root: &std::path::Path) -> PathBuf {
        root.join(&self.package)
            .join(self.version.to_string())
            .join(&self.activity)
            .join("raw_traces")
    }

    /// `<root>/<package>/<version>/<activity>/compiled_traces/`.
    pub fn compiled_traces_dir(&self, root: &std::path::Path) -> PathBuf {
        root.join(&self.package)
            .join(self.version.to_string())
            .join(&self.activity)
            .join("compiled_traces")
    }

    pub fn compiled_trace_path(&self, root: &std::path::Path) -> PathBuf {
        self.compiled_traces_dir(root).join("compiled_trace.pb")
    }

    pub fn raw_trace_path(&self, root: &std::path::Path, timestamp_ns: u64) -> PathBuf {
        self.raw_traces_dir(root)
            .join(format!("{timestamp_ns}.perfetto_trace.pb"))
    }
}

/// Prebuilt-on-disk fallback compiled trace: `/product/iorap-trace/<encoded
/// package>.compiled_trace.pb`. The encoding used by the original is the
/// package name verbatim (it contains no path separators); we keep that.
pub fn prebuilt_trace_path(package: &str) -> PathBuf {
    PathBuf::from("/product/iorap-trace").join(format!("{package}.compiled_trace.pb"))
}
