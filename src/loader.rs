//! Shared-object loading.
//!
//! Thin policy-carrying wrapper around [`libloading`]. The three policy axes are
//! chosen at open time: whether the mapping outlives the handle, when relocations are
//! resolved, and whether the object's symbols enter the global table.
//!
//! The orchestrator loads every builder plugin with `Process + Lazy + Local`: local
//! visibility because all plugins export the same three entry-point names and each
//! must resolve to its own definition, process lifetime because plugin code may
//! retain static state that outlives the phase call.

use crate::{path::AbsPath, ForgeError, Result};
use libloading::os::unix::{Library, Symbol, RTLD_GLOBAL, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};

/// Whether the library mapping is tied to the handle or to the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifetime {
    /// The library stays mapped for the remainder of the process; the handle leaks.
    Process,
    /// The library is unmapped when the handle drops.
    Dtor,
}

/// When relocations are resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Resolve at load time; missing symbols fail the open.
    Now,
    /// Defer resolution until first use; failures may surface later.
    Lazy,
}

/// Whether the object's symbols are added to the global symbol table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Local,
    Global,
}

/// RAII handle to a loaded shared object.
pub struct SharedLibrary {
    library: Option<Library>,
    lifetime: Lifetime,
    path: AbsPath,
}

impl SharedLibrary {
    /// Loads the shared object at `path` under the given policy.
    pub fn open(
        path: &AbsPath,
        lifetime: Lifetime,
        resolution: Resolution,
        visibility: Visibility,
    ) -> Result<Self> {
        let mut flags = match resolution {
            Resolution::Now => RTLD_NOW,
            Resolution::Lazy => RTLD_LAZY,
        };
        flags |= match visibility {
            Visibility::Local => RTLD_LOCAL,
            Visibility::Global => RTLD_GLOBAL,
        };

        let library =
            unsafe { Library::open(Some(path.as_std_path()), flags) }.map_err(|err| {
                ForgeError::Plugin {
                    path: path.as_std_path().into(),
                    detail: format!("failed to load: {err}"),
                }
            })?;
        Ok(Self { library: Some(library), lifetime, path: path.clone() })
    }

    /// Resolves a symbol by name.
    ///
    /// The caller bears the burden of `T` matching the symbol's actual signature; a
    /// mismatch is undefined behavior at call time, not at resolution time.
    ///
    /// # Safety
    ///
    /// `T` must be the correct type for the named symbol.
    pub unsafe fn resolve<T>(&self, name: &str) -> Result<Symbol<T>> {
        let library = self.library.as_ref().expect("present until drop");
        library.get(name.as_bytes()).map_err(|err| ForgeError::Plugin {
            path: self.path.as_std_path().into(),
            detail: format!("failed to resolve symbol '{name}': {err}"),
        })
    }

    /// The path this library was loaded from.
    pub fn path(&self) -> &AbsPath {
        &self.path
    }
}

impl Drop for SharedLibrary {
    fn drop(&mut self) {
        if let Some(library) = self.library.take() {
            match self.lifetime {
                // leak the handle so the mapping survives until process exit
                Lifetime::Process => {
                    let _ = library.into_raw();
                }
                Lifetime::Dtor => drop(library),
            }
        }
    }
}

impl std::fmt::Debug for SharedLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLibrary")
            .field("path", &self.path)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_library_reports_path() {
        let path = AbsPath::new("/nonexistent/no-such-plugin.so").unwrap();
        let err = SharedLibrary::open(&path, Lifetime::Dtor, Resolution::Lazy, Visibility::Local)
            .unwrap_err();
        assert!(err.to_string().contains("no-such-plugin.so"));
    }
}
