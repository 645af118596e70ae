//! Row types returned by [`super::Store`]. Kept separate from the query
//! methods so callers can pass rows around without depending on `sqlx`.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temperature {
    Cold = 1,
    Warm = 2,
    Hot = 3,
}

impl Temperature {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Temperature::Cold),
            2 => Some(Temperature::Warm),
            3 => Some(Temperature::Hot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRow {
    pub id: i64,
    pub name: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRow {
    pub id: i64,
    pub name: String,
    pub package_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLaunchHistoryRow {
    pub id: i64,
    pub activity_id: i64,
    pub temperature: Temperature,
    pub trace_enabled: bool,
    pub readahead_enabled: bool,
    pub intent_started_ns: Option<i64>,
    pub total_time_ns: Option<i64>,
    pub report_fully_drawn_ns: Option<i64>,
}

impl AppLaunchHistoryRow {
    pub(crate) fn from_row(row: SqliteRow) -> Self {
        Self {
            id: row.get(0),
            activity_id: row.get(1),
            temperature: Temperature::from_i64(row.get(2)).unwrap_or(Temperature::Cold),
            trace_enabled: row.get(3),
            readahead_enabled: row.get(4),
            intent_started_ns: row.get(5),
            total_time_ns: row.get(6),
            report_fully_drawn_ns: row.get(7),
        }
    }

    /// `ReportFullyDrawn` preferred, else `total_time_ns`, else no cutoff.
    pub fn timestamp_limit_ns(&self) -> Option<i64> {
        self.report_fully_drawn_ns.or(self.total_time_ns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTraceRow {
    pub id: i64,
    pub history_id: i64,
    pub file_path: String,
}

impl RawTraceRow {
    pub(crate) fn from_row(row: SqliteRow) -> Self {
        Self {
            id: row.get(0),
            history_id: row.get(1),
            file_path: row.get(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchFileRow {
    pub id: i64,
    pub activity_id: i64,
    pub file_path: String,
}

impl PrefetchFileRow {
    pub(crate) fn from_row(row: SqliteRow) -> Self {
        Self {
            id: row.get(0),
            activity_id: row.get(1),
            file_path: row.get(2),
        }
    }
}
