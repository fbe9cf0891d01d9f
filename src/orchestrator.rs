//! The orchestrator driver.
//!
//! One [`run`](Orchestrator::run) is the whole pipeline: self-version check (and
//! possibly a re-exec into a freshly built orchestrator), module discovery,
//! builder-dep validation, condensation, version propagation, the three phases of the
//! target module, and finally the stale-version sweep.
//!
//! The self-rebuild exists because the orchestrator's own source lives in the
//! workspace like any other module (the builtin `builder` module). When that source
//! is newer than the version baked into the running binary, the running binary builds
//! the new one with the toolchain façade and replaces itself with it, carrying the
//! original argv. The new process sees its baked version equal to the source version
//! and proceeds normally; no state survives the exec except what is on disk.

use crate::{
    builder::ModuleBuilder,
    fs,
    fs::{DescendPredicate, IncludePredicate},
    layout::{self, LibraryType, Phase},
    path::{AbsPath, RelPath},
    process::{self, Arg},
    resolver::{ModuleGraph, ModuleId, BUILDER_MODULE_NAME},
    toolchain::{self, ToolchainConfig},
    utils, Result,
};

/// File name of the orchestrator's entry translation unit inside the builtin module.
const DRIVER_SOURCE_FILE: &str = "driver.cpp";
/// File name of the orchestrator binary inside a versioned artifact directory.
const DRIVER_BINARY_FILE: &str = "driver";
/// File name of the orchestrator core shared library plugin consumers link against.
const CORE_LIBRARY_FILE: &str = "builder.so";

/// The version baked into this binary at compile time, 0 when none was baked.
///
/// A freshly cargo-built orchestrator therefore always defers to the workspace's
/// `builder` module if one exists.
pub fn baked_version() -> u64 {
    match option_env!("MODFORGE_VERSION") {
        Some(version) => version.parse().unwrap_or(0),
        None => 0,
    }
}

/// The driver record; all orchestrator state lives here and is passed by reference
/// into every component.
#[derive(Debug)]
pub struct Orchestrator {
    modules_dir: AbsPath,
    target: String,
    artifacts_dir: AbsPath,
    version: u64,
    toolchain: ToolchainConfig,
}

impl Orchestrator {
    pub fn new(modules_dir: AbsPath, target: impl Into<String>, artifacts_dir: AbsPath) -> Self {
        Self {
            modules_dir,
            target: target.into(),
            artifacts_dir,
            version: baked_version(),
            toolchain: toolchain::default_toolchain().clone(),
        }
    }

    /// Overrides the baked version; used by tests and by callers embedding the
    /// orchestrator.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_toolchain(mut self, toolchain: ToolchainConfig) -> Self {
        self.toolchain = toolchain;
        self
    }

    /// Runs the whole pipeline for the target module.
    pub fn run(&self) -> Result<()> {
        self.relaunch_if_outdated()?;

        let mut graph = ModuleGraph::discover(&self.modules_dir, &self.target)?;
        graph.validate_builder_deps()?;
        graph.condense();
        graph.propagate_versions(self.version);

        self.log_build_order(&graph);

        let builder = ModuleBuilder::new(
            &graph,
            graph.target(),
            self.artifacts_dir.clone(),
            &self.toolchain,
        );
        builder.run_phase(graph.target(), Phase::ExportInterface, Some(LibraryType::Shared))?;
        builder.run_phase(graph.target(), Phase::ExportLibraries, Some(LibraryType::Shared))?;
        builder.run_phase(graph.target(), Phase::ImportLibraries, None)?;

        self.remove_stale_versions(&graph)
    }

    /// Compares the baked version against the builtin module's source version and
    /// replaces this process with a freshly built orchestrator when the source is
    /// newer. Returns normally when the binary is current or the workspace carries no
    /// builtin module.
    fn relaunch_if_outdated(&self) -> Result<()> {
        let source_dir = self.modules_dir.join(&RelPath::new(BUILDER_MODULE_NAME)?)?;
        if !fs::is_dir(&source_dir) {
            trace!("workspace has no builtin module, skipping the self-version check");
            return Ok(())
        }

        let source_version = utils::source_version(&source_dir)?;
        if source_version <= self.version {
            return Ok(())
        }

        info!(
            baked = self.version,
            source = source_version,
            "orchestrator source is newer than this binary, rebuilding"
        );
        self.relaunch(&source_dir, source_version)
    }

    /// Builds the new orchestrator into its versioned artifact directory (unless it
    /// already exists) and execs it with the original argv. Only returns on failure.
    fn relaunch(&self, source_dir: &AbsPath, new_version: u64) -> Result<()> {
        let artifact_dir =
            layout::artifact_dir(&self.artifacts_dir, BUILDER_MODULE_NAME, new_version)?;
        let core_library = artifact_dir.join(&RelPath::new(CORE_LIBRARY_FILE)?)?;
        let driver_binary = artifact_dir.join(&RelPath::new(DRIVER_BINARY_FILE)?)?;

        if !fs::exists(&artifact_dir) {
            let cache_dir = artifact_dir.join(&RelPath::new("build")?)?;
            let driver_source = source_dir.join(&RelPath::new(DRIVER_SOURCE_FILE)?)?;
            // the include root is the parent of the modules dir so orchestrator
            // headers resolve as <modules_dir_name>/builder/...
            let include_dirs = vec![self.modules_dir.parent()?];

            let core_sources = fs::find(
                source_dir,
                &IncludePredicate::extension("cpp").and(IncludePredicate::path(&driver_source).not()),
                &DescendPredicate::descend_all(),
            )?;
            toolchain::create_shared_library(
                &self.toolchain,
                &cache_dir,
                source_dir,
                &include_dirs,
                &core_sources,
                &[],
                &[],
                &core_library,
            )?;
            toolchain::create_binary(
                &self.toolchain,
                &cache_dir,
                source_dir,
                &include_dirs,
                &[driver_source],
                &[("VERSION".to_string(), new_version.to_string())],
                &[vec![core_library.clone()]],
                true,
                &driver_binary,
            )?;
        }

        let args = [
            Arg::from(&driver_binary),
            Arg::from(&self.modules_dir),
            Arg::from(self.target.clone()),
            Arg::from(&self.artifacts_dir),
        ];
        Err(process::exec(&args))
    }

    /// Logs the planned build order: builder deps before a module, module deps after,
    /// the way the recursive build will actually reach them.
    fn log_build_order(&self, graph: &ModuleGraph) {
        info!("planned build order:");
        let mut visited = vec![false; graph.modules().count()];
        let mut position = 0;
        self.log_build_order_from(graph, graph.target(), &mut visited, &mut position);
    }

    fn log_build_order_from(
        &self,
        graph: &ModuleGraph,
        id: ModuleId,
        visited: &mut [bool],
        position: &mut usize,
    ) {
        if visited[id] {
            return
        }
        visited[id] = true;

        let module = graph.module(id);
        for &dep in module.builder_deps() {
            self.log_build_order_from(graph, dep, visited, position);
        }

        *position += 1;
        let deps = |ids: &[ModuleId]| {
            ids.iter().map(|&dep| graph.module(dep).name()).collect::<Vec<_>>().join(", ")
        };
        info!(
            "  {}. module '{}' version {} (builder_deps: [{}], module_deps: [{}])",
            position,
            module.name(),
            module.version(),
            deps(module.builder_deps()),
            deps(module.module_deps()),
        );

        for &dep in module.module_deps() {
            self.log_build_order_from(graph, dep, visited, position);
        }
    }

    /// Final sweep: for every discovered module, remove versioned artifact
    /// directories older than its propagated version.
    fn remove_stale_versions(&self, graph: &ModuleGraph) -> Result<()> {
        for (_, module) in graph.modules() {
            let root = layout::module_root(&self.artifacts_dir, module.name())?;
            if !fs::exists(&root) {
                continue
            }
            for entry in
                fs::find(&root, &IncludePredicate::is_dir(), &DescendPredicate::descend_none())?
            {
                if let Some((_, version)) = layout::parse_versioned(&entry) {
                    if version < module.version() {
                        debug!(module = %module.name(), stale = %entry, "removing stale version");
                        fs::remove_all(&entry)?;
                    }
                }
            }
        }
        Ok(())
    }
}
