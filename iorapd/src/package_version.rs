//! In-memory package name → version code cache (§6 "Package-manager
//! queries"), grounded on the original `PackageVersionMap`: check the RAM
//! map first, only fall through to the (comparatively expensive) package
//! manager query on a miss, and remember the answer either way so repeat
//! launches of the same package never re-query.

use crate::events::PackageManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct PackageVersionMap {
    package_manager: Arc<dyn PackageManager>,
    cache: RwLock<HashMap<String, i64>>,
}

impl PackageVersionMap {
    pub fn new(package_manager: Arc<dyn PackageManager>) -> Self {
        Self {
            package_manager,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Record a known version directly, e.g. from a `PackageChangeEvent`,
    /// without going through the package manager.
    pub async fn update(&self, package_name: &str, version: i64) {
        self.cache.write().await.insert(package_name.to_string(), version);
    }

    pub async fn remove(&self, package_name: &str) {
        self.cache.write().await.remove(package_name);
    }

    /// RAM-only lookup; does not query the package manager.
    pub async fn find(&self, package_name: &str) -> Option<i64> {
        self.cache.read().await.get(package_name).copied()
    }

    /// `find`, falling back to a package-manager query on a miss. A
    /// package with no version (uninstalled, or the query returned
    /// nothing) yields `None`; the caller must not fabricate a version.
    pub async fn get_or_query_package_version(&self, package_name: &str) -> Option<i64> {
        if let Some(v) = self.find(package_name).await {
            return Some(v);
        }
        let version = self.package_manager.get_version_code_for_package(package_name).await?;
        self.cache.write().await.insert(package_name.to_string(), version);
        Some(version)
    }

    /// Replace the entire cache with a fresh snapshot from the package
    /// manager (maintenance step 1, §4.8). Packages no longer reported are
    /// dropped from the cache; the caller is responsible for cascading
    /// that loss into the store.
    pub async fn refresh(&self) {
        let packages = self.package_manager.get_all_packages().await;
        let mut fresh = HashMap::with_capacity(packages.len());
        for name in packages {
            if let Some(v) = self.package_manager.get_version_code_for_package(&name).await {
                fresh.insert(name, v);
            }
        }
        *self.cache.write().await = fresh;
    }

    pub async fn snapshot(&self) -> HashMap<String, i64> {
        self.cache.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePackageManager {
        versions: HashMap<String, i64>,
        query_count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PackageManager for FakePackageManager {
        async fn get_version_code_for_package(&self, name: &str) -> Option<i64> {
            self.query_count.fetch_add(1, Ordering::SeqCst);
            self.versions.get(name).copied()
        }
        async fn get_all_packages(&self) -> Vec<String> {
            self.versions.keys().cloned().collect()
        }
    }

    #[tokio::test]
    async fn miss_queries_then_caches() {
        let pm = Arc::new(FakePackageManager {
            versions: HashMap::from([("com.foo".to_string(), 3)]),
            query_count: AtomicUsize::new(0),
        });
        let map = PackageVersionMap::new(pm.clone());

        assert_eq!(map.get_or_query_package_version("com.foo").await, Some(3));
        assert_eq!(map.get_or_query_package_version("com.foo").await, Some(3));
        assert_eq!(pm.query_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_package_yields_none_without_caching() {
        let pm = Arc::new(FakePackageManager { versions: HashMap::new(), query_count: AtomicUsize::new(0) });
        let map = PackageVersionMap::new(pm);
        assert_eq!(map.get_or_query_package_version("com.missing").await, None);
        assert_eq!(map.find("com.missing").await, None);
    }

    #[tokio::test]
    async fn update_bypasses_query() {
        let pm = Arc::new(FakePackageManager { versions: HashMap::new(), query_count: AtomicUsize::new(0) });
        let map = PackageVersionMap::new(pm.clone());
        map.update("com.foo", 9).await;
        assert_eq!(map.get_or_query_package_version("com.foo").await, Some(9));
        assert_eq!(pm.query_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_replaces_snapshot() {
        let pm = Arc::new(FakePackageManager {
            versions: HashMap::from([("com.foo".to_string(), 1), ("com.bar".to_string(), 2)]),
            query_count: AtomicUsize::new(0),
        });
        let map = PackageVersionMap::new(pm);
        map.update("com.stale", 1).await;
        map.refresh().await;
        let snap = map.snapshot().await;
        assert_eq!(snap.get("com.foo"), Some(&1));
        assert_eq!(snap.get("com.bar"), Some(&2));
        assert!(!snap.contains_key("com.stale"));
    }
}
