//! The plugin protocol: building builder plugins and driving their phases.
//!
//! Every phase of every module runs through the same harness, the *phase driver*:
//!
//! 1. if the phase's `install/` directory exists, the phase already completed for
//!    this version and nothing happens;
//! 2. a present `.in_progress` marker means the phase is currently executing (a
//!    plugin recursively triggering its own phase) and is fatal;
//! 3. otherwise the build directory and marker are created, the module's builder
//!    plugin is built and loaded, and the phase entry point is invoked;
//! 4. on success the marker is removed; on any failure the entire per-phase subtree
//!    is removed before the error propagates.
//!
//! Phases of the orchestrator's own source module are not plugin-driven; they are
//! delegated to `make` in that module's source directory.
//!
//! A [`ModuleBuilder`] is the view of one module handed to its plugin: path
//! accessors into the artifact layout plus the closure traversals
//! ([`export_interfaces`](ModuleBuilder::export_interfaces),
//! [`export_libraries`](ModuleBuilder::export_libraries)) that pull a module's
//! module-dep closure through the export phases in topological order.

use crate::{
    api, fs,
    fs::{DescendPredicate, IncludePredicate},
    layout::{self, LibraryType, Phase},
    loader::{Lifetime, Resolution, SharedLibrary, Visibility},
    path::{AbsPath, RelPath},
    process::{self, Arg},
    resolver::{ModuleGraph, ModuleId},
    toolchain::{self, ToolchainConfig},
    ForgeError, Result,
};

/// The view of one module handed to its builder plugin.
#[derive(Debug)]
pub struct ModuleBuilder<'g> {
    graph: &'g ModuleGraph,
    module: ModuleId,
    artifacts_dir: AbsPath,
    toolchain: &'g ToolchainConfig,
}

impl<'g> ModuleBuilder<'g> {
    pub fn new(
        graph: &'g ModuleGraph,
        module: ModuleId,
        artifacts_dir: AbsPath,
        toolchain: &'g ToolchainConfig,
    ) -> Self {
        Self { graph, module, artifacts_dir, toolchain }
    }

    fn for_module(&self, module: ModuleId) -> ModuleBuilder<'g> {
        ModuleBuilder {
            graph: self.graph,
            module,
            artifacts_dir: self.artifacts_dir.clone(),
            toolchain: self.toolchain,
        }
    }

    fn name(&self) -> &str {
        self.graph.module(self.module).name()
    }

    pub fn graph(&self) -> &ModuleGraph {
        self.graph
    }

    pub fn modules_dir(&self) -> &AbsPath {
        self.graph.modules_dir()
    }

    pub fn artifacts_dir(&self) -> &AbsPath {
        &self.artifacts_dir
    }

    pub fn source_dir(&self) -> &AbsPath {
        self.graph.module(self.module).source_dir()
    }

    /// The versioned artifact directory of this module.
    pub fn artifact_dir(&self) -> Result<AbsPath> {
        self.artifact_dir_of(self.module)
    }

    /// The stable `alias` symlink of this module.
    pub fn artifact_alias_dir(&self) -> Result<AbsPath> {
        layout::alias_dir(&self.artifacts_dir, self.name())
    }

    /// This module's `builder.cpp`.
    pub fn builder_source_path(&self) -> Result<AbsPath> {
        self.source_dir().join(&RelPath::new(layout::BUILDER_SOURCE_FILE)?)
    }

    pub fn interface_build_dir(&self, library_type: LibraryType) -> Result<AbsPath> {
        layout::interface_build_dir(&self.artifact_dir()?, library_type)
    }

    pub fn interface_install_dir(&self, library_type: LibraryType) -> Result<AbsPath> {
        self.interface_install_dir_of(self.module, library_type)
    }

    pub fn libraries_build_dir(&self, library_type: LibraryType) -> Result<AbsPath> {
        layout::libraries_build_dir(&self.artifact_dir()?, library_type)
    }

    pub fn libraries_install_dir(&self, library_type: LibraryType) -> Result<AbsPath> {
        self.libraries_install_dir_of(self.module, library_type)
    }

    pub fn import_build_dir(&self) -> Result<AbsPath> {
        layout::import_build_dir(&self.artifact_dir()?)
    }

    pub fn import_install_dir(&self) -> Result<AbsPath> {
        layout::import_install_dir(&self.artifact_dir()?)
    }

    fn artifact_dir_of(&self, module: ModuleId) -> Result<AbsPath> {
        let module = self.graph.module(module);
        layout::artifact_dir(&self.artifacts_dir, module.name(), module.version())
    }

    fn interface_install_dir_of(
        &self,
        module: ModuleId,
        library_type: LibraryType,
    ) -> Result<AbsPath> {
        let name = self.graph.module(module).name();
        layout::interface_install_dir(&self.artifact_dir_of(module)?, library_type, name)
    }

    fn libraries_install_dir_of(
        &self,
        module: ModuleId,
        library_type: LibraryType,
    ) -> Result<AbsPath> {
        layout::libraries_install_dir(&self.artifact_dir_of(module)?, library_type)
    }

    /// Runs `export-interface` for every module of this module's module-dep closure,
    /// dependencies first, and returns the include directories to feed to the
    /// compiler.
    pub fn export_interfaces(&self, library_type: LibraryType) -> Result<Vec<AbsPath>> {
        let mut include_dirs = Vec::new();
        self.graph.visit_module_dep_sccs_topo(self.module, &mut |scc| {
            for &member in scc.modules() {
                self.run_phase(member, Phase::ExportInterface, Some(library_type))?;
                let install_dir = self.interface_install_dir_of(member, library_type)?;
                if member == self.module {
                    let name = RelPath::new(self.graph.module(member).name())?;
                    include_dirs.push(install_dir.join(&name)?);
                } else {
                    include_dirs.push(install_dir);
                }
            }
            Ok(())
        })?;
        Ok(include_dirs)
    }

    /// Runs `export-libraries` over the same traversal and returns the exported
    /// libraries as one group per component, dependencies first.
    ///
    /// The group boundary is what lets the binary linker bracket genuinely cyclic
    /// components in start/end-group markers.
    pub fn export_libraries(&self, library_type: LibraryType) -> Result<Vec<Vec<AbsPath>>> {
        let mut library_groups = Vec::new();
        self.graph.visit_module_dep_sccs_topo(self.module, &mut |scc| {
            let mut group = Vec::new();
            for &member in scc.modules() {
                self.run_phase(member, Phase::ExportLibraries, Some(library_type))?;
                let libraries = fs::find(
                    &self.libraries_install_dir_of(member, library_type)?,
                    &IncludePredicate::is_dir().not(),
                    &DescendPredicate::descend_all(),
                )?;
                group.extend(libraries);
            }
            if !group.is_empty() {
                library_groups.push(group);
            }
            Ok(())
        })?;
        Ok(library_groups)
    }

    /// Runs this module's own `import-libraries` phase, the final link.
    pub fn import_libraries(&self) -> Result<()> {
        self.run_phase(self.module, Phase::ImportLibraries, None)
    }

    /// Copies an interface artifact into the install tree at the given relative path.
    pub fn install_interface(
        &self,
        artifact: &AbsPath,
        relative: &RelPath,
        library_type: LibraryType,
    ) -> Result<()> {
        install(artifact, &self.interface_install_dir(library_type)?, relative)
    }

    /// Copies a library artifact into the install tree at the given relative path.
    pub fn install_library(
        &self,
        artifact: &AbsPath,
        relative: &RelPath,
        library_type: LibraryType,
    ) -> Result<()> {
        install(artifact, &self.libraries_install_dir(library_type)?, relative)
    }

    /// Copies a final artifact into the import install tree.
    pub fn install_import(&self, artifact: &AbsPath, relative: &RelPath) -> Result<()> {
        install(artifact, &self.import_install_dir()?, relative)
    }

    /// The phase driver; see the module docs for the contract.
    pub fn run_phase(
        &self,
        module: ModuleId,
        phase: Phase,
        library_type: Option<LibraryType>,
    ) -> Result<()> {
        let name = self.graph.module(module).name().to_string();
        let artifact_dir = self.artifact_dir_of(module)?;
        let (build_dir, install_dir) = match (phase, library_type) {
            (Phase::ExportInterface, Some(lt)) => (
                layout::interface_build_dir(&artifact_dir, lt)?,
                layout::interface_install_dir(&artifact_dir, lt, &name)?,
            ),
            (Phase::ExportLibraries, Some(lt)) => (
                layout::libraries_build_dir(&artifact_dir, lt)?,
                layout::libraries_install_dir(&artifact_dir, lt)?,
            ),
            (Phase::ImportLibraries, None) => {
                (layout::import_build_dir(&artifact_dir)?, layout::import_install_dir(&artifact_dir)?)
            }
            (phase, library_type) => {
                return Err(ForgeError::msg(format!(
                    "phase {phase} does not take library type {library_type:?}"
                )))
            }
        };

        if fs::exists(&install_dir) {
            trace!(module = %name, phase = %phase, "phase already complete");
            return Ok(())
        }

        let marker = build_dir.join(&RelPath::new(layout::IN_PROGRESS_MARKER)?)?;
        if fs::exists(&marker) {
            return Err(ForgeError::Reentry { module: name, phase: phase.name() })
        }

        debug!(module = %name, phase = %phase, "running phase");
        match self.run_phase_guarded(module, phase, library_type, &build_dir, &install_dir, &marker)
        {
            Ok(()) => Ok(()),
            Err(err) => {
                // roll the whole per-phase subtree back before propagating
                let phase_root = layout::phase_dir(&artifact_dir, phase)?;
                if fs::exists(&phase_root) {
                    if let Err(cleanup) = fs::remove_all(&phase_root) {
                        warn!(module = %name, phase = %phase, error = %cleanup, "rollback failed");
                    }
                }
                Err(err.for_module(name))
            }
        }
    }

    fn run_phase_guarded(
        &self,
        module: ModuleId,
        phase: Phase,
        library_type: Option<LibraryType>,
        build_dir: &AbsPath,
        install_dir: &AbsPath,
        marker: &AbsPath,
    ) -> Result<()> {
        if !fs::exists(build_dir) {
            fs::create_directories(build_dir)?;
        }
        fs::touch(marker)?;
        fs::create_directories(install_dir)?;

        if Some(module) == self.graph.builder_module() {
            self.run_builder_module_phase(module, phase, library_type)?;
        } else {
            let plugin = self.build_plugin(module)?;
            let library =
                SharedLibrary::open(&plugin, Lifetime::Process, Resolution::Lazy, Visibility::Local)?;
            let view = self.for_module(module);
            api::invoke_entry(&library, phase, &view, library_type)?;

            if phase == Phase::ExportLibraries {
                self.swing_alias(module)?;
                self.purge_stale_versions(module)?;
            }
        }
        fs::remove(marker)
    }

    /// Phases of the orchestrator's own source module are driven by its makefile
    /// rather than a plugin.
    fn run_builder_module_phase(
        &self,
        module: ModuleId,
        phase: Phase,
        library_type: Option<LibraryType>,
    ) -> Result<()> {
        let library_type = library_type.unwrap_or(LibraryType::Shared);
        let record = self.graph.module(module);
        let name = record.name();
        let source_dir = record.source_dir().clone();
        let artifact_dir = self.artifact_dir_of(module)?;

        let args: Vec<Arg> = vec![
            Arg::from(&self.toolchain.make),
            "-C".into(),
            Arg::from(&source_dir),
            phase.make_target().into(),
            format!("SOURCE_DIR={source_dir}").into(),
            format!("LIBRARY_TYPE={}", library_type.dir_name()).into(),
            format!(
                "INTERFACE_BUILD_DIR={}",
                layout::interface_build_dir(&artifact_dir, library_type)?
            )
            .into(),
            format!(
                "INTERFACE_INSTALL_DIR={}",
                layout::interface_install_dir(&artifact_dir, library_type, name)?
            )
            .into(),
            format!(
                "LIBRARIES_BUILD_DIR={}",
                layout::libraries_build_dir(&artifact_dir, library_type)?
            )
            .into(),
            format!(
                "LIBRARIES_INSTALL_DIR={}",
                layout::libraries_install_dir(&artifact_dir, library_type)?
            )
            .into(),
            format!("IMPORT_BUILD_DIR={}", layout::import_build_dir(&artifact_dir)?).into(),
            format!("IMPORT_INSTALL_DIR={}", layout::import_install_dir(&artifact_dir)?).into(),
            format!("ARTIFACT_DIR={artifact_dir}").into(),
            format!("ARTIFACT_ALIAS_DIR={}", layout::alias_dir(&self.artifacts_dir, name)?).into(),
        ];

        match process::spawn_and_wait(&args)? {
            0 => Ok(()),
            status if status > 0 => Err(ForgeError::msg(format!(
                "failed to run phase {phase} of module '{name}', command exited with code {status}"
            ))),
            status => Err(ForgeError::msg(format!(
                "failed to run phase {phase} of module '{name}', command terminated by signal {}",
                -status
            ))),
        }
    }

    /// Ensures the module's builder plugin exists and returns its path.
    ///
    /// The plugin is one `create_shared_library` call over `builder.cpp`: its include
    /// path is the orchestrator core interface plus every builder-dep's interface,
    /// and its link line appends the core shared libraries plus every builder-dep's
    /// plugin. Builder deps are ensured depth-first, so the closure is built in
    /// topological order.
    fn build_plugin(&self, module: ModuleId) -> Result<AbsPath> {
        let record = self.graph.module(module);
        let artifact_dir = self.artifact_dir_of(module)?;
        let plugin = layout::builder_plugin_path(&artifact_dir)?;

        if !fs::exists(&plugin) {
            if Some(module) == self.graph.builder_module() {
                // the builtin module's plugin is produced by its own export phases
                return Err(ForgeError::Plugin {
                    path: plugin.as_std_path().into(),
                    detail: format!(
                        "builder plugin for module '{}' should exist at this point",
                        record.name()
                    ),
                })
            }

            debug!(module = %record.name(), "building builder plugin");
            let mut include_dirs = Vec::new();
            let mut dsos = Vec::new();

            // the orchestrator core, when the workspace carries its source module
            if let Some(builder) = self.graph.builder_module() {
                self.run_phase(builder, Phase::ExportInterface, Some(LibraryType::Shared))?;
                include_dirs.push(self.interface_install_dir_of(builder, LibraryType::Shared)?);
                self.run_phase(builder, Phase::ExportLibraries, Some(LibraryType::Shared))?;
                dsos.extend(fs::find(
                    &self.libraries_install_dir_of(builder, LibraryType::Shared)?,
                    &IncludePredicate::is_dir().not(),
                    &DescendPredicate::descend_all(),
                )?);
            }

            for &dep in record.builder_deps() {
                if dep == module {
                    continue
                }
                dsos.push(self.build_plugin(dep)?);
                self.run_phase(dep, Phase::ExportInterface, Some(LibraryType::Shared))?;
                include_dirs.push(self.interface_install_dir_of(dep, LibraryType::Shared)?);
            }

            let source_dir = record.source_dir().clone();
            let builder_source = source_dir.join(&RelPath::new(layout::BUILDER_SOURCE_FILE)?)?;
            toolchain::create_shared_library(
                self.toolchain,
                &layout::builder_build_dir(&artifact_dir)?,
                &source_dir,
                &include_dirs,
                &[builder_source],
                &[],
                &dsos,
                &plugin,
            )?;
        }

        if !fs::exists(&plugin) {
            return Err(ForgeError::Plugin {
                path: plugin.as_std_path().into(),
                detail: "expected builder plugin to exist but it does not".to_string(),
            })
        }
        Ok(plugin)
    }

    /// Atomically repoints `artifacts_dir/<name>/alias` at the current version
    /// directory: a temporary symlink is created and renamed over the alias.
    fn swing_alias(&self, module: ModuleId) -> Result<()> {
        let name = self.graph.module(module).name();
        let alias = layout::alias_dir(&self.artifacts_dir, name)?;
        let alias_tmp = alias.with_postfix("_tmp")?;
        if fs::exists(&alias_tmp) {
            fs::remove_all(&alias_tmp)?;
        }
        fs::create_directory_symlink(&self.artifact_dir_of(module)?, &alias_tmp)?;
        fs::rename_replace(&alias_tmp, &alias)
    }

    /// Removes every versioned sibling of the current version directory whose parsed
    /// version is older.
    fn purge_stale_versions(&self, module: ModuleId) -> Result<()> {
        let record = self.graph.module(module);
        let root = layout::module_root(&self.artifacts_dir, record.name())?;
        for entry in
            fs::find(&root, &IncludePredicate::is_dir(), &DescendPredicate::descend_none())?
        {
            if let Some((_, version)) = layout::parse_versioned(&entry) {
                if version < record.version() {
                    debug!(module = %record.name(), stale = %entry, "removing stale version");
                    fs::remove_all(&entry)?;
                }
            }
        }
        Ok(())
    }
}

fn install(artifact: &AbsPath, install_dir: &AbsPath, relative: &RelPath) -> Result<()> {
    let target = install_dir.join(relative)?;
    let parent = target.parent()?;
    if !fs::exists(&parent) {
        fs::create_directories(&parent)?;
    }
    fs::copy(artifact, &target)
}
