//! Path value types with containment invariants.
//!
//! [`AbsPath`] is always absolute and lexically normalized, [`RelPath`] is always
//! relative. All composition is checked: joining can only produce strict lexical
//! descendants of the base, appending a postfix can only produce siblings. These two
//! types are the sole path currency inside the build system, which rules out the
//! usual class of `..`-traversal bugs at the type level.

use crate::{ForgeError, Result};
use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

/// Removes `.` components and resolves `..` components lexically, without touching the
/// filesystem. `/..` stays at the root; a relative path keeps leading `..` components.
fn normalize(path: &Path) -> PathBuf {
    enum Last {
        Root,
        Normal,
        Other,
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let last = match out.components().next_back() {
                    Some(Component::RootDir | Component::Prefix(_)) => Last::Root,
                    Some(Component::Normal(_)) => Last::Normal,
                    _ => Last::Other,
                };
                match last {
                    // nothing to pop above the root
                    Last::Root => {}
                    Last::Normal => {
                        out.pop();
                    }
                    Last::Other => out.push(Component::ParentDir.as_os_str()),
                }
            }
            Component::Normal(component) => out.push(component),
        }
    }
    out
}

/// An absolute, lexically normalized filesystem path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsPath {
    inner: PathBuf,
}

impl AbsPath {
    /// Constructs a normalized absolute path.
    ///
    /// Fails if the given path is not absolute.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(ForgeError::Path(format!("path is not absolute: \"{}\"", path.display())))
        }
        Ok(Self { inner: normalize(&path) })
    }

    /// Constructs an absolute path from a possibly relative one by resolving it against
    /// the current working directory.
    pub fn absolutize(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_absolute() {
            return Self::new(path)
        }
        let cwd = std::env::current_dir().map_err(|err| ForgeError::io(err, &path))?;
        Self::new(cwd.join(path))
    }

    /// Returns the parent directory.
    ///
    /// Fails when the path is a filesystem root.
    pub fn parent(&self) -> Result<AbsPath> {
        match self.inner.parent() {
            Some(parent) => Ok(Self { inner: parent.to_path_buf() }),
            None => {
                Err(ForgeError::Path(format!("path has no parent: \"{}\"", self.inner.display())))
            }
        }
    }

    /// Joins a relative path component.
    ///
    /// The result must be a strict lexical descendant of the base: joining fails if the
    /// normalized result escapes the base or equals it.
    pub fn join(&self, relative: &RelPath) -> Result<AbsPath> {
        let joined = Self { inner: normalize(&self.inner.join(&relative.inner)) };
        if !self.is_child(&joined) {
            return Err(ForgeError::Path(format!(
                "joining \"{}\" onto \"{}\" escapes the base",
                relative.inner.display(),
                self.inner.display()
            )))
        }
        Ok(joined)
    }

    /// Checks whether `other` is a strict lexical descendant of this path.
    pub fn is_child(&self, other: &AbsPath) -> bool {
        other.inner != self.inner && other.inner.starts_with(&self.inner)
    }

    /// Returns the unique relative path such that `descendant == self / result`.
    ///
    /// Fails if `descendant` is not a strict lexical descendant of this path.
    pub fn relative(&self, descendant: &AbsPath) -> Result<RelPath> {
        if !self.is_child(descendant) {
            return Err(ForgeError::Path(format!(
                "\"{}\" is not a descendant of \"{}\"",
                descendant.inner.display(),
                self.inner.display()
            )))
        }
        let relative = descendant
            .inner
            .strip_prefix(&self.inner)
            .expect("checked by is_child above")
            .to_path_buf();
        RelPath::new(relative)
    }

    /// Appends a postfix to the final path component; the result is a sibling of the
    /// base.
    ///
    /// Fails at a filesystem root or when the postfix contains a path separator.
    pub fn with_postfix(&self, postfix: &str) -> Result<AbsPath> {
        let file_name = self.file_name().ok_or_else(|| {
            ForgeError::Path(format!("cannot append to root path \"{}\"", self.inner.display()))
        })?;
        validate_postfix(postfix)?;
        Ok(Self { inner: self.inner.with_file_name(format!("{file_name}{postfix}")) })
    }

    /// Replaces the file extension; the result is a sibling of the base.
    pub fn with_extension(&self, extension: &str) -> Result<AbsPath> {
        if self.file_name().is_none() {
            return Err(ForgeError::Path(format!(
                "cannot set extension on root path \"{}\"",
                self.inner.display()
            )))
        }
        Ok(Self { inner: self.inner.with_extension(extension) })
    }

    /// Returns the final path component, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.inner.file_name().and_then(|name| name.to_str())
    }

    /// Returns the underlying standard path.
    pub fn as_std_path(&self) -> &Path {
        &self.inner
    }

    pub(crate) fn from_normalized(path: PathBuf) -> Self {
        debug_assert!(path.is_absolute());
        Self { inner: path }
    }
}

impl AsRef<Path> for AbsPath {
    fn as_ref(&self) -> &Path {
        &self.inner
    }
}

impl From<AbsPath> for PathBuf {
    fn from(path: AbsPath) -> Self {
        path.inner
    }
}

impl fmt::Display for AbsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.display())
    }
}

/// A relative filesystem path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelPath {
    inner: PathBuf,
}

impl RelPath {
    /// Constructs a normalized relative path.
    ///
    /// Fails if the given path is absolute or normalizes to nothing.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_absolute() {
            return Err(ForgeError::Path(format!("path is not relative: \"{}\"", path.display())))
        }
        let inner = normalize(&path);
        if inner.as_os_str().is_empty() {
            return Err(ForgeError::Path(format!(
                "path normalizes to nothing: \"{}\"",
                path.display()
            )))
        }
        Ok(Self { inner })
    }

    /// Appends a postfix to the final path component.
    pub fn with_postfix(&self, postfix: &str) -> Result<RelPath> {
        let file_name = self.file_name().ok_or_else(|| {
            ForgeError::Path(format!("path has no file name: \"{}\"", self.inner.display()))
        })?;
        validate_postfix(postfix)?;
        Ok(Self { inner: self.inner.with_file_name(format!("{file_name}{postfix}")) })
    }

    /// Replaces the file extension.
    pub fn with_extension(&self, extension: &str) -> RelPath {
        Self { inner: self.inner.with_extension(extension) }
    }

    /// Returns the final path component, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.inner.file_name().and_then(|name| name.to_str())
    }

    /// Returns the underlying standard path.
    pub fn as_std_path(&self) -> &Path {
        &self.inner
    }
}

impl AsRef<Path> for RelPath {
    fn as_ref(&self) -> &Path {
        &self.inner
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.display())
    }
}

fn validate_postfix(postfix: &str) -> Result<()> {
    if postfix.is_empty() || postfix.contains(std::path::MAIN_SEPARATOR) {
        return Err(ForgeError::Path(format!("invalid file name postfix: \"{postfix}\"")))
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn abs(s: &str) -> AbsPath {
        AbsPath::new(s).unwrap()
    }

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    #[test]
    fn normalizes_on_construction() {
        assert_eq!(abs("/a/./b/../c").as_std_path(), Path::new("/a/c"));
        assert_eq!(abs("/../..").as_std_path(), Path::new("/"));
        assert_eq!(rel("a/./b/..").as_std_path(), Path::new("a"));
    }

    #[test]
    fn rejects_wrong_kind() {
        assert!(AbsPath::new("relative/path").is_err());
        assert!(RelPath::new("/absolute/path").is_err());
        assert!(RelPath::new(".").is_err());
        assert!(RelPath::new("a/..").is_err());
    }

    #[test]
    fn parent_of_root_fails() {
        assert!(abs("/").parent().is_err());
        assert_eq!(abs("/a/b").parent().unwrap(), abs("/a"));
    }

    #[test]
    fn join_stays_contained() {
        let base = abs("/work/modules");
        assert_eq!(base.join(&rel("m1/builder.cpp")).unwrap(), abs("/work/modules/m1/builder.cpp"));
        assert!(base.join(&rel("..")).is_err());
        assert!(base.join(&rel("m1/../../etc")).is_err());
    }

    #[test]
    fn is_child_is_strict() {
        let base = abs("/work");
        assert!(base.is_child(&abs("/work/a")));
        assert!(base.is_child(&abs("/work/a/b")));
        assert!(!base.is_child(&abs("/work")));
        assert!(!base.is_child(&abs("/workbench")));
    }

    #[test]
    fn relative_roundtrips() {
        let base = abs("/work");
        let child = abs("/work/a/b");
        let relative = base.relative(&child).unwrap();
        assert_eq!(relative, rel("a/b"));
        assert_eq!(base.join(&relative).unwrap(), child);
        assert!(base.relative(&abs("/other")).is_err());
        assert!(base.relative(&base).is_err());
    }

    #[test]
    fn postfix_appends_to_file_name() {
        assert_eq!(abs("/a/alias").with_postfix("_tmp").unwrap(), abs("/a/alias_tmp"));
        assert!(abs("/").with_postfix("_tmp").is_err());
        assert!(abs("/a/b").with_postfix("x/y").is_err());
        assert_eq!(rel("alias").with_postfix("_tmp").unwrap(), rel("alias_tmp"));
    }

    #[test]
    fn extension_replacement() {
        assert_eq!(abs("/a/b.cpp").with_extension("o").unwrap(), abs("/a/b.o"));
        assert_eq!(rel("b.cpp").with_extension("o"), rel("b.o"));
    }
}
