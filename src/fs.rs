//! Controlled interface to the native filesystem.
//!
//! Every operation takes the checked path types from [`crate::path`] and reports
//! failures as [`ForgeIoError`](crate::ForgeIoError)s carrying the offending path. [`find`] is the one
//! traversal primitive: a pre-order walk driven by two composable predicates, one
//! deciding inclusion in the result and one deciding descent into subdirectories.

use crate::{path::AbsPath, ForgeError, Result};
use std::{fs, io, sync::Arc, time::SystemTime};

/// Checks whether a path exists.
pub fn exists(path: &AbsPath) -> bool {
    path.as_std_path().symlink_metadata().is_ok()
}

/// Checks whether the path refers to a directory.
pub fn is_dir(path: &AbsPath) -> bool {
    path.as_std_path().is_dir()
}

/// Checks whether the path refers to a regular file.
pub fn is_file(path: &AbsPath) -> bool {
    path.as_std_path().is_file()
}

/// Creates the directory and all missing parents.
pub fn create_directories(path: &AbsPath) -> Result<()> {
    fs::create_dir_all(path).map_err(|err| ForgeError::io(err, path))
}

/// Copies a file, or a directory tree recursively.
pub fn copy(src: &AbsPath, dst: &AbsPath) -> Result<()> {
    if is_dir(src) {
        create_directories(dst)?;
        for entry in walkdir::WalkDir::new(src).min_depth(1) {
            let entry = entry.map_err(|err| walk_err(err, src))?;
            let target = dst
                .as_std_path()
                .join(entry.path().strip_prefix(src).expect("walk stays under src"));
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).map_err(|err| ForgeError::io(err, target))?;
            } else {
                fs::copy(entry.path(), &target).map_err(|err| ForgeError::io(err, target))?;
            }
        }
        Ok(())
    } else {
        fs::copy(src, dst).map(drop).map_err(|err| ForgeError::io(err, dst))
    }
}

/// Updates the last modification timestamp, creating an empty file if it does not
/// exist. The parent directory must exist.
pub fn touch(path: &AbsPath) -> Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| ForgeError::io(err, path))?;
    let now = fs::FileTimes::new().set_modified(SystemTime::now());
    fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_times(now))
        .map_err(|err| ForgeError::io(err, path))
}

/// Removes a single file or empty directory.
pub fn remove(path: &AbsPath) -> Result<()> {
    let result = if is_dir(path) { fs::remove_dir(path) } else { fs::remove_file(path) };
    result.map_err(|err| ForgeError::io(err, path))
}

/// Recursively removes a directory tree, or a single file.
pub fn remove_all(path: &AbsPath) -> Result<()> {
    let result = if path.as_std_path().is_symlink() || !is_dir(path) {
        fs::remove_file(path)
    } else {
        fs::remove_dir_all(path)
    };
    result.map_err(|err| ForgeError::io(err, path))
}

/// Renames `from` to `to` without overwriting; fails if `to` already exists.
pub fn rename_strict(from: &AbsPath, to: &AbsPath) -> Result<()> {
    if exists(to) {
        return Err(ForgeError::io(
            io::Error::new(io::ErrorKind::AlreadyExists, "rename target already exists"),
            to,
        ))
    }
    fs::rename(from, to).map_err(|err| ForgeError::io(err, from))
}

/// Atomically renames `from` to `to`, replacing `to` if it exists.
pub fn rename_replace(from: &AbsPath, to: &AbsPath) -> Result<()> {
    fs::rename(from, to).map_err(|err| ForgeError::io(err, from))
}

/// Creates a symbolic link at `link` pointing to `target`.
pub fn create_symlink(target: &AbsPath, link: &AbsPath) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|err| ForgeError::io(err, link))
}

/// Creates a directory symbolic link at `link` pointing to `target`.
///
/// On unix this is the same call as [`create_symlink`]; kept separate because the two
/// operations differ on other platforms and call sites state their intent with it.
pub fn create_directory_symlink(target: &AbsPath, link: &AbsPath) -> Result<()> {
    create_symlink(target, link)
}

/// Returns the canonical path, resolving all symbolic links.
pub fn canonical(path: &AbsPath) -> Result<AbsPath> {
    let canonical = dunce::canonicalize(path).map_err(|err| ForgeError::io(err, path))?;
    AbsPath::new(canonical)
}

/// Returns the last modification timestamp.
pub fn last_write_time(path: &AbsPath) -> Result<SystemTime> {
    path.as_std_path()
        .symlink_metadata()
        .and_then(|meta| meta.modified())
        .map_err(|err| ForgeError::io(err, path))
}

fn walk_err(err: walkdir::Error, dir: &AbsPath) -> ForgeError {
    let path = err.path().map(|p| p.to_path_buf()).unwrap_or_else(|| dir.as_std_path().into());
    match err.into_io_error() {
        Some(io) => ForgeError::io(io, path),
        None => ForgeError::io(io::Error::other("walk cycle"), path),
    }
}

/// Predicate deciding whether an encountered entry is included in a [`find`] result.
#[derive(Clone)]
pub struct IncludePredicate {
    predicate: Arc<dyn Fn(&AbsPath) -> bool>,
}

impl IncludePredicate {
    pub fn new(predicate: impl Fn(&AbsPath) -> bool + 'static) -> Self {
        Self { predicate: Arc::new(predicate) }
    }

    /// Includes every entry.
    pub fn include_all() -> Self {
        Self::new(|_| true)
    }

    /// Includes directories.
    pub fn is_dir() -> Self {
        Self::new(|path| is_dir(path))
    }

    /// Includes regular files.
    pub fn is_regular() -> Self {
        Self::new(|path| is_file(path))
    }

    /// Includes entries with the given file extension, without the leading dot.
    pub fn extension(extension: &str) -> Self {
        let extension = extension.to_string();
        Self::new(move |path| {
            path.as_std_path().extension().map(|ext| ext == extension.as_str()).unwrap_or(false)
        })
    }

    /// Includes entries matching the given basename.
    pub fn file_name(name: &str) -> Self {
        let name = name.to_string();
        Self::new(move |path| path.file_name() == Some(name.as_str()))
    }

    /// Includes exactly the given path.
    pub fn path(target: &AbsPath) -> Self {
        let target = target.clone();
        Self::new(move |path| *path == target)
    }

    pub fn matches(&self, path: &AbsPath) -> bool {
        (self.predicate)(path)
    }

    pub fn and(self, other: Self) -> Self {
        Self::new(move |path| self.matches(path) && other.matches(path))
    }

    pub fn or(self, other: Self) -> Self {
        Self::new(move |path| self.matches(path) || other.matches(path))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::new(move |path| !self.matches(path))
    }
}

/// Predicate deciding whether a [`find`] walk descends into a directory at a depth.
///
/// Depth 0 is the set of immediate children of the walk root.
#[derive(Clone)]
pub struct DescendPredicate {
    predicate: Arc<dyn Fn(&AbsPath, usize) -> bool>,
}

impl DescendPredicate {
    pub fn new(predicate: impl Fn(&AbsPath, usize) -> bool + 'static) -> Self {
        Self { predicate: Arc::new(predicate) }
    }

    /// Descends into every directory.
    pub fn descend_all() -> Self {
        Self::new(|_, _| true)
    }

    /// Never descends; only the root's immediate children are visited.
    pub fn descend_none() -> Self {
        Self::new(|_, _| false)
    }

    pub fn matches(&self, dir: &AbsPath, depth: usize) -> bool {
        (self.predicate)(dir, depth)
    }

    pub fn and(self, other: Self) -> Self {
        Self::new(move |dir, depth| self.matches(dir, depth) && other.matches(dir, depth))
    }

    pub fn or(self, other: Self) -> Self {
        Self::new(move |dir, depth| self.matches(dir, depth) || other.matches(dir, depth))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::new(move |dir, depth| !self.matches(dir, depth))
    }
}

/// Pre-order directory walk.
///
/// For each entry `e` at depth `d` under `dir`: if `include.matches(e)` the entry is
/// appended to the result, and if `e` is a directory and `descend.matches(e, d)` the
/// walk recurses into it. Entries of one directory are visited in name order so the
/// output is stable across runs. The tree must not be modified during traversal.
pub fn find(
    dir: &AbsPath,
    include: &IncludePredicate,
    descend: &DescendPredicate,
) -> Result<Vec<AbsPath>> {
    let mut found = Vec::new();
    walk(dir, include, descend, 0, &mut found)?;
    Ok(found)
}

fn walk(
    dir: &AbsPath,
    include: &IncludePredicate,
    descend: &DescendPredicate,
    depth: usize,
    found: &mut Vec<AbsPath>,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(|err| ForgeError::io(err, dir))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| ForgeError::io(err, dir))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = AbsPath::from_normalized(entry.path());
        if include.matches(&path) {
            found.push(path.clone());
        }
        if is_dir(&path) && descend.matches(&path, depth) {
            walk(&path, include, descend, depth + 1, found)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::RelPath;

    fn abs(path: impl Into<std::path::PathBuf>) -> AbsPath {
        AbsPath::new(path.into()).unwrap()
    }

    fn tree(root: &AbsPath, files: &[&str]) {
        for file in files {
            let path = root.join(&RelPath::new(file).unwrap()).unwrap();
            create_directories(&path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"x").unwrap();
        }
    }

    #[test]
    fn find_descend_none_stays_shallow() {
        let tmp = tempfile::tempdir().unwrap();
        let root = abs(tmp.path());
        tree(&root, &["a.txt", "sub/b.txt"]);

        let found = find(
            &root,
            &IncludePredicate::is_regular(),
            &DescendPredicate::descend_none(),
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_name(), Some("a.txt"));
    }

    #[test]
    fn find_is_preorder_and_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let root = abs(tmp.path());
        tree(&root, &["b/z.txt", "b/a.txt", "a.txt"]);

        let found =
            find(&root, &IncludePredicate::include_all(), &DescendPredicate::descend_all())
                .unwrap();
        let names = found.iter().map(|p| p.file_name().unwrap().to_string()).collect::<Vec<_>>();
        assert_eq!(names, vec!["a.txt", "b", "a.txt", "z.txt"]);
    }

    #[test]
    fn find_predicates_compose() {
        let tmp = tempfile::tempdir().unwrap();
        let root = abs(tmp.path());
        tree(&root, &["keep.cpp", "skip.txt", "sub/also.cpp"]);

        let found = find(
            &root,
            &IncludePredicate::extension("cpp").and(IncludePredicate::is_dir().not()),
            &DescendPredicate::descend_all(),
        )
        .unwrap();
        assert_eq!(found.len(), 2);

        let found = find(
            &root,
            &IncludePredicate::file_name("keep.cpp").or(IncludePredicate::file_name("skip.txt")),
            &DescendPredicate::descend_all(),
        )
        .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn rename_strict_refuses_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let root = abs(tmp.path());
        tree(&root, &["a", "b"]);
        let a = root.join(&RelPath::new("a").unwrap()).unwrap();
        let b = root.join(&RelPath::new("b").unwrap()).unwrap();
        assert!(rename_strict(&a, &b).is_err());
        rename_replace(&a, &b).unwrap();
        assert!(!exists(&a));
    }

    #[test]
    fn copy_copies_trees() {
        let tmp = tempfile::tempdir().unwrap();
        let root = abs(tmp.path());
        tree(&root, &["src/a.txt", "src/sub/b.txt"]);
        let src = root.join(&RelPath::new("src").unwrap()).unwrap();
        let dst = root.join(&RelPath::new("dst").unwrap()).unwrap();
        copy(&src, &dst).unwrap();
        assert!(exists(&dst.join(&RelPath::new("sub/b.txt").unwrap()).unwrap()));
    }

    #[test]
    fn canonical_resolves_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = abs(tmp.path());
        tree(&root, &["real/file.txt"]);
        let real = root.join(&RelPath::new("real").unwrap()).unwrap();
        let link = root.join(&RelPath::new("link").unwrap()).unwrap();
        create_directory_symlink(&real, &link).unwrap();
        assert_eq!(canonical(&link).unwrap(), canonical(&real).unwrap());
    }

    #[test]
    fn touch_creates_and_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let root = abs(tmp.path());
        let marker = root.join(&RelPath::new(".in_progress").unwrap()).unwrap();
        assert!(!exists(&marker));
        touch(&marker).unwrap();
        assert!(exists(&marker));

        let before = last_write_time(&marker).unwrap();
        touch(&marker).unwrap();
        assert!(last_write_time(&marker).unwrap() >= before);
    }
}
