//! Relational persistence store (C6): packages, activities, launch
//! histories, raw traces, and compiled prefetch files, with cascade
//! deletes wired through `ON DELETE CASCADE` rather than hand-rolled
//! fan-out deletes.

mod models;

pub use models::{ActivityRow, AppLaunchHistoryRow, PackageRow, PrefetchFileRow, RawTraceRow, Temperature};

use crate::component::VersionedComponentName;
use crate::error::Result;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use std::path::Path;

/// Bumped whenever the schema below changes shape. A persisted value that
/// doesn't match this triggers drop-and-recreate, files first.
pub const SCHEMA_VERSION: i32 = 1;

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON;").execute(&pool).await?;

        let store = Self { pool };
        store.ensure_schema(db_path).await?;
        Ok(store)
    }

    async fn ensure_schema(&self, db_path: &Path) -> Result<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_versions (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;

        let persisted: Option<i32> = sqlx::query("SELECT version FROM schema_versions LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.get(0));

        match persisted {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(_) => {
                self.drop_and_recreate(db_path).await?;
            }
            None => {
                self.create_tables().await?;
                sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Schema version mismatch: every on-disk raw/prefetch file referenced
    /// by existing rows must be deleted before the tables themselves are
    /// dropped, since once the rows are gone nothing but this sweep can
    /// find those files again.
    async fn drop_and_recreate(&self, _db_path: &Path) -> Result<()> {
        let raw_paths: Vec<String> = sqlx::query("SELECT file_path FROM raw_traces")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.get(0))
            .collect();
        let prefetch_paths: Vec<String> = sqlx::query("SELECT file_path FROM prefetch_files")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.get(0))
            .collect();
        for path in raw_paths.iter().chain(prefetch_paths.iter()) {
            let _ = std::fs::remove_file(path);
        }

        for table in [
            "prefetch_files",
            "raw_traces",
            "app_launch_history",
            "activities",
            "packages",
            "schema_versions",
        ] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&self.pool)
                .await?;
        }
        self.create_tables().await?;
        sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS packages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                UNIQUE(name, version)
            );
            CREATE TABLE IF NOT EXISTS activities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                package_id INTEGER NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
                UNIQUE(name, package_id)
            );
            CREATE TABLE IF NOT EXISTS app_launch_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id INTEGER NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
                temperature INTEGER NOT NULL,
                trace_enabled INTEGER NOT NULL,
                readahead_enabled INTEGER NOT NULL,
                intent_started_ns INTEGER,
                total_time_ns INTEGER,
                report_fully_drawn_ns INTEGER
            );
            CREATE TABLE IF NOT EXISTS raw_traces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                history_id INTEGER NOT NULL REFERENCES app_launch_history(id) ON DELETE CASCADE,
                file_path TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS prefetch_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id INTEGER NOT NULL UNIQUE REFERENCES activities(id) ON DELETE CASCADE,
                file_path TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- packages / activities --------------------------------------

    pub async fn insert_or_get_package(&self, name: &str, version: i64) -> Result<i64> {
        if let Some(row) = sqlx::query("SELECT id FROM packages WHERE name = ? AND version = ?")
            .bind(name)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.get(0));
        }
        let result = sqlx::query("INSERT INTO packages (name, version) VALUES (?, ?)")
            .bind(name)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_or_get_activity(&self, package_id: i64, name: &str) -> Result<i64> {
        if let Some(row) = sqlx::query("SELECT id FROM activities WHERE name = ? AND package_id = ?")
            .bind(name)
            .bind(package_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.get(0));
        }
        let result = sqlx::query("INSERT INTO activities (name, package_id) VALUES (?, ?)")
            .bind(name)
            .bind(package_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Delete every package row whose stored version differs from
    /// `live_version`, or (if `live_version` is `None`) the package is no
    /// longer installed. Cascades to activities, histories, raw traces,
    /// and prefetch files.
    pub async fn delete_stale_package(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM packages WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_package_version(&self, name: &str, version: i64) -> Result<()> {
        sqlx::query("DELETE FROM packages WHERE name = ? AND version = ?")
            .bind(name)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- launch history -----------------------------------------------

    pub async fn insert_history(
        &self,
        activity_id: i64,
        temperature: Temperature,
        trace_enabled: bool,
        readahead_enabled: bool,
        intent_started_ns: Option<i64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO app_launch_history
                (activity_id, temperature, trace_enabled, readahead_enabled, intent_started_ns)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(activity_id)
        .bind(temperature as i64)
        .bind(trace_enabled)
        .bind(readahead_enabled)
        .bind(intent_started_ns)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_total_time(&self, history_id: i64, total_time_ns: i64) -> Result<()> {
        sqlx::query("UPDATE app_launch_history SET total_time_ns = ? WHERE id = ?")
            .bind(total_time_ns)
            .bind(history_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_report_fully_drawn(&self, history_id: i64, t_ns: i64) -> Result<()> {
        sqlx::query("UPDATE app_launch_history SET report_fully_drawn_ns = ? WHERE id = ?")
            .bind(t_ns)
            .bind(history_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cold, trace-enabled rows with a non-null `intent_started_ns`, in
    /// insertion order — the only rows eligible for compilation.
    pub async fn select_activity_history_for_compile(
        &self,
        activity_id: i64,
    ) -> Result<Vec<AppLaunchHistoryRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, activity_id, temperature, trace_enabled, readahead_enabled,
                   intent_started_ns, total_time_ns, report_fully_drawn_ns
            FROM app_launch_history
            WHERE activity_id = ? AND temperature = ? AND trace_enabled = 1
                  AND intent_started_ns IS NOT NULL
            ORDER BY id ASC
            "#,
        )
        .bind(activity_id)
        .bind(Temperature::Cold as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AppLaunchHistoryRow::from_row).collect())
    }

    // -- raw traces ------------------------------------------------------

    pub async fn insert_raw_trace(&self, history_id: i64, file_path: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO raw_traces (history_id, file_path) VALUES (?, ?)")
            .bind(history_id)
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// All raw traces for a versioned component, newest-last by id, as
    /// `RawTraceModel::SelectByVersionedComponentName` does.
    pub async fn select_raw_traces_by_vcn(&self, vcn: &VersionedComponentName) -> Result<Vec<RawTraceRow>> {
        let rows = sqlx::query(
            r#"
            SELECT rt.id, rt.history_id, rt.file_path
            FROM raw_traces rt
            JOIN app_launch_history h ON h.id = rt.history_id
            JOIN activities a ON a.id = h.activity_id
            JOIN packages p ON p.id = a.package_id
            WHERE p.name = ? AND p.version = ? AND a.name = ?
            ORDER BY rt.id ASC
            "#,
        )
        .bind(&vcn.package)
        .bind(vcn.version)
        .bind(&vcn.activity)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RawTraceRow::from_row).collect())
    }

    /// Keep only the newest `max_traces` raw-trace files for this component
    /// (ranked by the integer timestamp encoded in the filename, not by row
    /// id — a manually dropped-in file can have a newer timestamp with an
    /// older row id), deleting the rest along with their rows and the files
    /// on disk.
    pub async fn delete_older_raw_traces(
        &self,
        vcn: &VersionedComponentName,
        max_traces: usize,
    ) -> Result<()> {
        let mut rows = self.select_raw_traces_by_vcn(vcn).await?;
        rows.sort_by_key(|r| filename_timestamp(&r.file_path));
        if rows.len() <= max_traces {
            return Ok(());
        }
        let drop_count = rows.len() - max_traces;
        for row in rows.into_iter().take(drop_count) {
            let _ = std::fs::remove_file(&row.file_path);
            sqlx::query("DELETE FROM raw_traces WHERE id = ?")
                .bind(row.id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // -- prefetch files ----------------------------------------------

    pub async fn upsert_prefetch_file(&self, activity_id: i64, file_path: &str) -> Result<i64> {
        if let Some(existing) = sqlx::query("SELECT file_path FROM prefetch_files WHERE activity_id = ?")
            .bind(activity_id)
            .fetch_optional(&self.pool)
            .await?
        {
            let old_path: String = existing.get(0);
            if old_path != file_path {
                let _ = std::fs::remove_file(&old_path);
            }
            sqlx::query("UPDATE prefetch_files SET file_path = ? WHERE activity_id = ?")
                .bind(file_path)
                .bind(activity_id)
                .execute(&self.pool)
                .await?;
            let row: (i64,) = sqlx::query_as("SELECT id FROM prefetch_files WHERE activity_id = ?")
                .bind(activity_id)
                .fetch_one(&self.pool)
                .await?;
            return Ok(row.0);
        }
        let result = sqlx::query("INSERT INTO prefetch_files (activity_id, file_path) VALUES (?, ?)")
            .bind(activity_id)
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn select_prefetch_file(&self, activity_id: i64) -> Result<Option<PrefetchFileRow>> {
        let row = sqlx::query("SELECT id, activity_id, file_path FROM prefetch_files WHERE activity_id = ?")
            .bind(activity_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PrefetchFileRow::from_row))
    }

    /// A `PrefetchFile` row whose file no longer exists on disk is stale:
    /// treat it as absent and let the caller schedule recompilation.
    pub async fn select_live_prefetch_file(&self, activity_id: i64) -> Result<Option<PrefetchFileRow>> {
        match self.select_prefetch_file(activity_id).await? {
            Some(row) if Path::new(&row.file_path).exists() => Ok(Some(row)),
            Some(row) => {
                sqlx::query("DELETE FROM prefetch_files WHERE id = ?")
                    .bind(row.id)
                    .execute(&self.pool)
                    .await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // -- maintenance glue ----------------------------------------------

    /// `(package, activity, version)` for a single activity id, the shape
    /// the maintenance controller and the launch pipeline both need to
    /// address a versioned component's on-disk layout.
    pub async fn select_activity_vcn(&self, activity_id: i64) -> Result<Option<VersionedComponentName>> {
        let row = sqlx::query(
            r#"
            SELECT p.name, a.name, p.version
            FROM activities a
            JOIN packages p ON p.id = a.package_id
            WHERE a.id = ?
            "#,
        )
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| VersionedComponentName::new(r.get::<String, _>(0), r.get::<String, _>(1), r.get(2))))
    }

    /// Every `(activity_id, vcn)` pair that has at least one launch-history
    /// row, i.e. every component maintenance needs to consider. Grouping by
    /// `(package, activity, version)` rather than raw history rows matches
    /// the original controller's iteration shape (§2 supplemented
    /// behavior).
    pub async fn select_all_versioned_components(&self) -> Result<Vec<(i64, VersionedComponentName)>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT a.id, p.name, a.name, p.version
            FROM activities a
            JOIN packages p ON p.id = a.package_id
            JOIN app_launch_history h ON h.activity_id = a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let activity_id: i64 = r.get(0);
                let vcn = VersionedComponentName::new(r.get::<String, _>(1), r.get::<String, _>(2), r.get(3));
                (activity_id, vcn)
            })
            .collect())
    }

    /// Every distinct `(package name, version)` pair currently stored,
    /// refreshed against the live package manager during maintenance.
    pub async fn select_all_package_versions(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT DISTINCT name, version FROM packages")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| (r.get(0), r.get(1))).collect())
    }
}

/// Parse the leading integer prefix of a `<timestamp_ns>.perfetto_trace.pb`
/// filename. Falls back to 0 (oldest) for anything that doesn't match, so a
/// malformed name never wins a retention tie.
fn filename_timestamp(path: &str) -> u64 {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    name.split('.')
        .next()
        .and_then(|prefix| prefix.parse::<u64>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_tmp() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("iorapd.db");
        let store = Store::open(&db_path).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn package_activity_roundtrip() {
        let (store, _dir) = open_tmp().await;
        let pkg = store.insert_or_get_package("com.foo", 3).await.unwrap();
        let pkg2 = store.insert_or_get_package("com.foo", 3).await.unwrap();
        assert_eq!(pkg, pkg2);

        let act = store.insert_or_get_activity(pkg, "com.foo.Main").await.unwrap();
        let act2 = store.insert_or_get_activity(pkg, "com.foo.Main").await.unwrap();
        assert_eq!(act, act2);
    }

    #[tokio::test]
    async fn cascade_delete_removes_history() {
        let (store, _dir) = open_tmp().await;
        let pkg = store.insert_or_get_package("com.foo", 1).await.unwrap();
        let act = store.insert_or_get_activity(pkg, "com.foo.Main").await.unwrap();
        let hist = store
            .insert_history(act, Temperature::Cold, true, true, Some(10))
            .await
            .unwrap();
        store.insert_raw_trace(hist, "/tmp/x.pb").await.unwrap();

        store.delete_stale_package("com.foo").await.unwrap();

        let histories = store.select_activity_history_for_compile(act).await.unwrap();
        assert!(histories.is_empty());
    }

    #[tokio::test]
    async fn only_cold_trace_enabled_rows_are_compilable() {
        let (store, _dir) = open_tmp().await;
        let pkg = store.insert_or_get_package("com.foo", 1).await.unwrap();
        let act = store.insert_or_get_activity(pkg, "com.foo.Main").await.unwrap();
        store
            .insert_history(act, Temperature::Warm, true, true, Some(1))
            .await
            .unwrap();
        store
            .insert_history(act, Temperature::Cold, false, true, Some(1))
            .await
            .unwrap();
        store
            .insert_history(act, Temperature::Cold, true, true, None)
            .await
            .unwrap();
        let eligible = store
            .insert_history(act, Temperature::Cold, true, true, Some(99))
            .await
            .unwrap();

        let rows = store.select_activity_history_for_compile(act).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, eligible);
    }

    #[tokio::test]
    async fn prefetch_file_upsert_replaces_and_removes_old_file() {
        let (store, dir) = open_tmp().await;
        let pkg = store.insert_or_get_package("com.foo", 1).await.unwrap();
        let act = store.insert_or_get_activity(pkg, "com.foo.Main").await.unwrap();

        let old_path = dir.path().join("old.pb");
        std::fs::write(&old_path, b"x").unwrap();
        store
            .upsert_prefetch_file(act, old_path.to_str().unwrap())
            .await
            .unwrap();

        let new_path = dir.path().join("new.pb");
        std::fs::write(&new_path, b"y").unwrap();
        store
            .upsert_prefetch_file(act, new_path.to_str().unwrap())
            .await
            .unwrap();

        assert!(!old_path.exists());
        let row = store.select_prefetch_file(act).await.unwrap().unwrap();
        assert_eq!(row.file_path, new_path.to_str().unwrap());
    }

    #[tokio::test]
    async fn missing_prefetch_file_is_treated_as_stale() {
        let (store, dir) = open_tmp().await;
        let pkg = store.insert_or_get_package("com.foo", 1).await.unwrap();
        let act = store.insert_or_get_activity(pkg, "com.foo.Main").await.unwrap();
        let path = dir.path().join("gone.pb");
        std::fs::write(&path, b"x").unwrap();
        store.upsert_prefetch_file(act, path.to_str().unwrap()).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let live = store.select_live_prefetch_file(act).await.unwrap();
        assert!(live.is_none());
        assert!(store.select_prefetch_file(act).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn versioned_components_only_list_activities_with_history() {
        let (store, _dir) = open_tmp().await;
        let pkg = store.insert_or_get_package("com.foo", 3).await.unwrap();
        let with_history = store.insert_or_get_activity(pkg, "com.foo.Main").await.unwrap();
        let without_history = store.insert_or_get_activity(pkg, "com.foo.Other").await.unwrap();
        store
            .insert_history(with_history, Temperature::Cold, true, true, Some(1))
            .await
            .unwrap();

        let components = store.select_all_versioned_components().await.unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].0, with_history);
        assert_eq!(components[0].1.package, "com.foo");
        assert_eq!(components[0].1.activity, "com.foo.Main");
        assert_eq!(components[0].1.version, 3);
        assert_ne!(components[0].0, without_history);
    }

    #[tokio::test]
    async fn select_all_package_versions_is_distinct() {
        let (store, _dir) = open_tmp().await;
        store.insert_or_get_package("com.foo", 1).await.unwrap();
        store.insert_or_get_package("com.foo", 1).await.unwrap();
        store.insert_or_get_package("com.bar", 2).await.unwrap();

        let mut versions = store.select_all_package_versions().await.unwrap();
        versions.sort();
        assert_eq!(
            versions,
            vec![("com.bar".to_string(), 2), ("com.foo".to_string(), 1)]
        );
    }

    #[test]
    fn filename_timestamp_parses_prefix() {
        assert_eq!(filename_timestamp("/a/b/12345.perfetto_trace.pb"), 12345);
        assert_eq!(filename_timestamp("/a/b/not_a_number.pb"), 0);
    }
}
