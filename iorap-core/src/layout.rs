//! Directory creation for the on-disk trace layout. Path *shape* lives on
//! [`crate::component::VersionedComponentName`]; this module only creates
//! the directories those paths point into.

use crate::component::VersionedComponentName;
use crate::error::Result;
use std::path::Path;

#[cfg(unix)]
const DIR_MODE: u32 = 0o755;

/// Ensure `<root>/<package>/<version>/<activity>/{raw_traces,compiled_traces}`
/// exist, creating any missing intermediate directory with mode 0755.
pub fn ensure_component_dirs(root: &Path, vcn: &VersionedComponentName) -> Result<()> {
    create_dir_all_with_mode(&vcn.raw_traces_dir(root))?;
    create_dir_all_with_mode(&vcn.compiled_traces_dir(root))?;
    Ok(())
}

#[cfg(unix)]
fn create_dir_all_with_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(DIR_MODE);
    builder.create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir_all_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_both_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let vcn = VersionedComponentName::new("com.foo", "com.foo.Main", 1);
        ensure_component_dirs(dir.path(), &vcn).unwrap();
        assert!(vcn.raw_traces_dir(dir.path()).is_dir());
        assert!(vcn.compiled_traces_dir(dir.path()).is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn directories_get_0755_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let vcn = VersionedComponentName::new("com.foo", "com.foo.Main", 1);
        ensure_component_dirs(dir.path(), &vcn).unwrap();
        let mode = std::fs::metadata(vcn.raw_traces_dir(dir.path()))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o755);
    }
}
