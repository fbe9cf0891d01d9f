//! Utility functions

use crate::{path::AbsPath, ForgeError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the source version of a module directory: the maximum modification
/// timestamp of any entry recursively under it, as nanoseconds since the epoch.
///
/// An empty tree has version 0. Timestamps before the epoch clamp to 0, so the result
/// is always a non-negative monotone function of the tree's newest write.
pub fn source_version(dir: &AbsPath) -> Result<u64> {
    fn walk_err(err: walkdir::Error, fallback: &AbsPath) -> ForgeError {
        let path = err
            .path()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| fallback.as_std_path().into());
        match err.into_io_error() {
            Some(io) => ForgeError::io(io, path),
            None => ForgeError::io(std::io::Error::other("walk cycle"), path),
        }
    }

    let mut version = 0u64;
    for entry in walkdir::WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|err| walk_err(err, dir))?;
        let meta = entry.metadata().map_err(|err| walk_err(err, dir))?;
        let modified = meta.modified().map_err(|err| ForgeError::io(err, entry.path()))?;
        version = version.max(timestamp(modified));
    }
    Ok(version)
}

fn timestamp(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::RelPath;

    #[test]
    fn version_tracks_newest_write() {
        let tmp = tempfile::tempdir().unwrap();
        let root = AbsPath::new(tmp.path()).unwrap();
        assert_eq!(source_version(&root).unwrap(), 0);

        let file = root.join(&RelPath::new("a.cpp").unwrap()).unwrap();
        std::fs::write(&file, b"int x;").unwrap();
        let first = source_version(&root).unwrap();
        assert!(first > 0);

        // push the mtime forward instead of sleeping
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        let times = std::fs::FileTimes::new().set_modified(later);
        std::fs::File::options().write(true).open(&file).unwrap().set_times(times).unwrap();
        let second = source_version(&root).unwrap();
        assert!(second > first);
    }

    #[test]
    fn version_sees_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = AbsPath::new(tmp.path()).unwrap();
        let nested = root.join(&RelPath::new("sub/deep/b.cpp").unwrap()).unwrap();
        std::fs::create_dir_all(nested.parent().unwrap()).unwrap();
        std::fs::write(&nested, b"int y;").unwrap();
        assert!(source_version(&root).unwrap() > 0);
    }
}
