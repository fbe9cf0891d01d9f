//! Artifact tree layout.
//!
//! Pure mapping from `(artifacts_dir, module, version, phase, library type)` to paths.
//! This layout is the whole contract between the orchestrator and plugin code: plugins
//! write outputs under paths derived here, and the phase driver decides cache hits by
//! the presence of a phase's `install/` subtree.
//!
//! ```text
//! artifacts_dir/<name>/<name>@<version>/
//!     builder/                  { build/ , install/builder.so }
//!     interface/<library_type>/ { build/ , install/<name>/ }
//!     libraries/<library_type>/ { build/ , install/ }
//!     import/                   { build/ , install/ }
//! artifacts_dir/<name>/alias -> <name>@<current version>
//! ```

use crate::{
    path::{AbsPath, RelPath},
    Result,
};

/// File name of a module's builder plugin source.
pub const BUILDER_SOURCE_FILE: &str = "builder.cpp";
/// File name of a module's compiled builder plugin.
pub const BUILDER_PLUGIN_FILE: &str = "builder.so";
/// Marker dropped into a phase's `build/` directory while the phase executes.
pub const IN_PROGRESS_MARKER: &str = ".in_progress";
/// Name of the stable symlink to the current version directory.
pub const ALIAS_DIR_NAME: &str = "alias";

/// How a module's libraries are built and consumed.
///
/// The discriminants are the plugin ABI encoding and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LibraryType {
    Static = 0,
    Shared = 1,
}

impl LibraryType {
    /// The per-type subdirectory name under `interface/` and `libraries/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            LibraryType::Static => "static",
            LibraryType::Shared => "shared",
        }
    }

    /// Decodes the one-byte ABI tag.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(LibraryType::Static),
            1 => Some(LibraryType::Shared),
            _ => None,
        }
    }
}

impl std::fmt::Display for LibraryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One unit of plugin-side work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    ExportInterface,
    ExportLibraries,
    ImportLibraries,
}

impl Phase {
    /// Human-readable phase name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Phase::ExportInterface => "export-interface",
            Phase::ExportLibraries => "export-libraries",
            Phase::ImportLibraries => "import-libraries",
        }
    }

    /// The C-linkage entry point a builder plugin must export for this phase.
    pub fn entry_symbol(self) -> &'static str {
        match self {
            Phase::ExportInterface => "module_builder__export_interface",
            Phase::ExportLibraries => "module_builder__export_libraries",
            Phase::ImportLibraries => "module_builder__import_libraries",
        }
    }

    /// The make target driving this phase for the orchestrator's builtin module.
    pub fn make_target(self) -> &'static str {
        match self {
            Phase::ExportInterface => "export_interface",
            Phase::ExportLibraries => "export_libraries",
            Phase::ImportLibraries => "import_libraries",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn rel(component: &str) -> Result<RelPath> {
    RelPath::new(component)
}

/// `artifacts_dir/<name>`, the per-module root holding all versions and the alias.
pub fn module_root(artifacts_dir: &AbsPath, name: &str) -> Result<AbsPath> {
    artifacts_dir.join(&rel(name)?)
}

/// `artifacts_dir/<name>/<name>@<version>`
pub fn artifact_dir(artifacts_dir: &AbsPath, name: &str, version: u64) -> Result<AbsPath> {
    module_root(artifacts_dir, name)?.join(&rel(&format!("{name}@{version}"))?)
}

/// `artifacts_dir/<name>/alias`
pub fn alias_dir(artifacts_dir: &AbsPath, name: &str) -> Result<AbsPath> {
    module_root(artifacts_dir, name)?.join(&rel(ALIAS_DIR_NAME)?)
}

/// Extracts `(name, version)` from a `<name>@<version>` directory.
///
/// Directories without an `@`, or with an unparsable version, are not versioned and
/// are ignored by the purge logic.
pub fn parse_versioned(dir: &AbsPath) -> Option<(&str, u64)> {
    let (name, version) = dir.file_name()?.split_once('@')?;
    Some((name, version.parse().ok()?))
}

pub fn builder_dir(artifact_dir: &AbsPath) -> Result<AbsPath> {
    artifact_dir.join(&rel("builder")?)
}

pub fn builder_build_dir(artifact_dir: &AbsPath) -> Result<AbsPath> {
    builder_dir(artifact_dir)?.join(&rel("build")?)
}

pub fn builder_install_dir(artifact_dir: &AbsPath) -> Result<AbsPath> {
    builder_dir(artifact_dir)?.join(&rel("install")?)
}

/// `<artifact_dir>/builder/install/builder.so`
pub fn builder_plugin_path(artifact_dir: &AbsPath) -> Result<AbsPath> {
    builder_install_dir(artifact_dir)?.join(&rel(BUILDER_PLUGIN_FILE)?)
}

pub fn interface_dir(artifact_dir: &AbsPath) -> Result<AbsPath> {
    artifact_dir.join(&rel("interface")?)
}

pub fn interface_build_dir(artifact_dir: &AbsPath, library_type: LibraryType) -> Result<AbsPath> {
    interface_dir(artifact_dir)?.join(&rel(library_type.dir_name())?)?.join(&rel("build")?)
}

/// `<artifact_dir>/interface/<library_type>/install/<name>`: the interface install
/// tree nests the module name so dependents can include `<name>/header.h`.
pub fn interface_install_dir(
    artifact_dir: &AbsPath,
    library_type: LibraryType,
    name: &str,
) -> Result<AbsPath> {
    interface_dir(artifact_dir)?
        .join(&rel(library_type.dir_name())?)?
        .join(&rel("install")?)?
        .join(&rel(name)?)
}

pub fn libraries_dir(artifact_dir: &AbsPath) -> Result<AbsPath> {
    artifact_dir.join(&rel("libraries")?)
}

pub fn libraries_build_dir(artifact_dir: &AbsPath, library_type: LibraryType) -> Result<AbsPath> {
    libraries_dir(artifact_dir)?.join(&rel(library_type.dir_name())?)?.join(&rel("build")?)
}

pub fn libraries_install_dir(
    artifact_dir: &AbsPath,
    library_type: LibraryType,
) -> Result<AbsPath> {
    libraries_dir(artifact_dir)?.join(&rel(library_type.dir_name())?)?.join(&rel("install")?)
}

pub fn import_dir(artifact_dir: &AbsPath) -> Result<AbsPath> {
    artifact_dir.join(&rel("import")?)
}

pub fn import_build_dir(artifact_dir: &AbsPath) -> Result<AbsPath> {
    import_dir(artifact_dir)?.join(&rel("build")?)
}

pub fn import_install_dir(artifact_dir: &AbsPath) -> Result<AbsPath> {
    import_dir(artifact_dir)?.join(&rel("install")?)
}

/// The per-phase root removed wholesale when the phase fails.
pub fn phase_dir(artifact_dir: &AbsPath, phase: Phase) -> Result<AbsPath> {
    match phase {
        Phase::ExportInterface => interface_dir(artifact_dir),
        Phase::ExportLibraries => libraries_dir(artifact_dir),
        Phase::ImportLibraries => import_dir(artifact_dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn abs(s: &str) -> AbsPath {
        AbsPath::new(s).unwrap()
    }

    #[test]
    fn versioned_artifact_tree() {
        let artifacts = abs("/artifacts");
        let artifact = artifact_dir(&artifacts, "m1", 42).unwrap();
        assert_eq!(artifact, abs("/artifacts/m1/m1@42"));
        assert_eq!(builder_plugin_path(&artifact).unwrap(), abs("/artifacts/m1/m1@42/builder/install/builder.so"));
        assert_eq!(
            interface_install_dir(&artifact, LibraryType::Shared, "m1").unwrap(),
            abs("/artifacts/m1/m1@42/interface/shared/install/m1")
        );
        assert_eq!(
            libraries_build_dir(&artifact, LibraryType::Static).unwrap(),
            abs("/artifacts/m1/m1@42/libraries/static/build")
        );
        assert_eq!(import_install_dir(&artifact).unwrap(), abs("/artifacts/m1/m1@42/import/install"));
        assert_eq!(alias_dir(&artifacts, "m1").unwrap(), abs("/artifacts/m1/alias"));
    }

    #[test]
    fn parses_versioned_directories() {
        assert_eq!(parse_versioned(&abs("/artifacts/m1/m1@7")), Some(("m1", 7)));
        assert_eq!(parse_versioned(&abs("/artifacts/m1/alias")), None);
        assert_eq!(parse_versioned(&abs("/artifacts/m1/m1@not-a-number")), None);
        // '@' in the name itself: the version is everything after the first '@'
        assert_eq!(parse_versioned(&abs("/artifacts/m1/m1@")), None);
    }

    #[test]
    fn phase_roots() {
        let artifact = artifact_dir(&abs("/a"), "m", 1).unwrap();
        assert_eq!(phase_dir(&artifact, Phase::ExportInterface).unwrap(), abs("/a/m/m@1/interface"));
        assert_eq!(phase_dir(&artifact, Phase::ExportLibraries).unwrap(), abs("/a/m/m@1/libraries"));
        assert_eq!(phase_dir(&artifact, Phase::ImportLibraries).unwrap(), abs("/a/m/m@1/import"));
    }

    #[test]
    fn abi_tags_are_stable() {
        assert_eq!(LibraryType::Static as u8, 0);
        assert_eq!(LibraryType::Shared as u8, 1);
        assert_eq!(LibraryType::from_raw(1), Some(LibraryType::Shared));
        assert_eq!(LibraryType::from_raw(2), None);
    }
}
