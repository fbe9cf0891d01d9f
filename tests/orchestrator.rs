//! Driver-level scenarios on real on-disk workspaces.
//!
//! Everything up to, but not including, toolchain invocations: phases are either
//! expected to fail before reaching the compiler or are pre-seeded as complete so the
//! phase driver takes its cache-hit path.

use modforge::{
    fs, layout, AbsPath, ForgeError, LibraryType, ModuleBuilder, ModuleGraph, Orchestrator, Phase,
    RelPath, ToolchainConfig,
};
use pretty_assertions::assert_eq;

fn rel(s: &str) -> RelPath {
    RelPath::new(s).unwrap()
}

struct Workspace {
    _tmp: tempfile::TempDir,
    modules_dir: AbsPath,
    artifacts_dir: AbsPath,
}

impl Workspace {
    fn new(modules: &[(&str, &str)]) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = AbsPath::new(tmp.path()).unwrap();
        let modules_dir = root.join(&rel("modules")).unwrap();
        let artifacts_dir = root.join(&rel("artifacts")).unwrap();
        std::fs::create_dir_all(&modules_dir).unwrap();
        std::fs::create_dir_all(&artifacts_dir).unwrap();
        for (name, manifest) in modules {
            let dir = modules_dir.join(&rel(name)).unwrap();
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(&rel("builder.cpp")).unwrap(), b"").unwrap();
            std::fs::write(dir.join(&rel("deps.json")).unwrap(), manifest).unwrap();
        }
        Self { _tmp: tmp, modules_dir, artifacts_dir }
    }

    fn resolve(&self, target: &str) -> ModuleGraph {
        let mut graph = ModuleGraph::discover(&self.modules_dir, target).unwrap();
        graph.validate_builder_deps().unwrap();
        graph.condense();
        graph.propagate_versions(0);
        graph
    }

    fn orchestrator(&self, target: &str) -> Orchestrator {
        Orchestrator::new(self.modules_dir.clone(), target, self.artifacts_dir.clone())
    }

    /// Seeds the three phase install trees of a module at its propagated version, so
    /// a subsequent run treats every phase as already complete.
    fn seed_complete_artifacts(&self, graph: &ModuleGraph, name: &str) -> AbsPath {
        let module = graph.module(graph.module_id(name).unwrap());
        let artifact =
            layout::artifact_dir(&self.artifacts_dir, module.name(), module.version()).unwrap();
        let install_dirs = [
            layout::interface_install_dir(&artifact, LibraryType::Shared, module.name()).unwrap(),
            layout::libraries_install_dir(&artifact, LibraryType::Shared).unwrap(),
            layout::import_install_dir(&artifact).unwrap(),
        ];
        for dir in &install_dirs {
            std::fs::create_dir_all(dir).unwrap();
        }
        artifact
    }
}

const LEAF: &str = r#"{"builder_deps": [], "module_deps": []}"#;

#[test]
fn trivial_single_module_resolves_to_one_component() {
    let workspace = Workspace::new(&[("m1", LEAF)]);
    let graph = workspace.resolve("m1");

    assert_eq!(graph.sccs().len(), 1);
    assert_eq!(graph.scc(0).modules().len(), 1);
    assert!(graph.module(graph.target()).version() > 0);
}

#[test]
fn linear_chain_keeps_versions_monotone() {
    let workspace = Workspace::new(&[
        ("m1", LEAF),
        ("m2", r#"{"builder_deps": [], "module_deps": ["m1"]}"#),
        ("m3", r#"{"builder_deps": [], "module_deps": ["m2"]}"#),
    ]);
    let graph = workspace.resolve("m3");

    assert_eq!(graph.sccs().len(), 3);
    let version = |name: &str| graph.module(graph.module_id(name).unwrap()).version();
    assert!(version("m3") >= version("m2"));
    assert!(version("m2") >= version("m1"));

    // link groups preserve the component boundary, dependencies first
    let mut order = Vec::new();
    graph
        .visit_module_dep_sccs_topo(graph.target(), &mut |scc| {
            order.push(graph.module(scc.modules()[0]).name().to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(order, vec!["m1", "m2", "m3"]);
}

#[test]
fn module_dep_cycle_bundles_into_one_component() {
    let workspace = Workspace::new(&[
        ("m1", r#"{"builder_deps": [], "module_deps": ["m2"]}"#),
        ("m2", r#"{"builder_deps": [], "module_deps": ["m1"]}"#),
    ]);
    let graph = workspace.resolve("m1");

    assert_eq!(graph.sccs().len(), 1);
    let members = graph
        .scc(0)
        .modules()
        .iter()
        .map(|&m| graph.module(m).name().to_string())
        .collect::<Vec<_>>();
    assert_eq!(members, vec!["m1", "m2"]);
    let version = |name: &str| graph.module(graph.module_id(name).unwrap()).version();
    assert_eq!(version("m1"), version("m2"));
}

#[test]
fn builder_dep_cycle_fails_before_writing_artifacts() {
    let workspace = Workspace::new(&[
        ("m1", r#"{"builder_deps": ["m2"], "module_deps": []}"#),
        ("m2", r#"{"builder_deps": ["m1"], "module_deps": []}"#),
    ]);

    let err = workspace.orchestrator("m1").run().unwrap_err();
    match &err {
        ForgeError::BuilderDepCycle(cycle) => {
            assert!(cycle.contains(&"m1".to_string()));
            assert!(cycle.contains(&"m2".to_string()));
        }
        other => panic!("expected a builder-dep cycle, got {other}"),
    }
    assert!(err.to_string().contains("cycle"));

    // nothing may have been written
    let entries = std::fs::read_dir(&workspace.artifacts_dir).unwrap().count();
    assert_eq!(entries, 0);
}

#[test]
fn unknown_target_is_a_discovery_error() {
    let workspace = Workspace::new(&[("m1", LEAF)]);
    let err = workspace.orchestrator("nope").run().unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn completed_phases_short_circuit_the_whole_run() {
    let workspace = Workspace::new(&[("m1", LEAF)]);
    let graph = workspace.resolve("m1");
    let artifact = workspace.seed_complete_artifacts(&graph, "m1");

    // with all three install trees present the run never touches a toolchain
    workspace.orchestrator("m1").run().unwrap();
    assert!(fs::exists(&artifact));
}

#[test]
fn stale_versions_are_swept_after_a_successful_run() {
    let workspace = Workspace::new(&[("m1", LEAF)]);
    let graph = workspace.resolve("m1");
    let current = workspace.seed_complete_artifacts(&graph, "m1");

    let stale = layout::artifact_dir(&workspace.artifacts_dir, "m1", 1).unwrap();
    std::fs::create_dir_all(&stale).unwrap();
    // unversioned siblings are not purge candidates
    let unversioned = layout::module_root(&workspace.artifacts_dir, "m1")
        .unwrap()
        .join(&rel("scratch"))
        .unwrap();
    std::fs::create_dir_all(&unversioned).unwrap();

    workspace.orchestrator("m1").run().unwrap();

    assert!(!fs::exists(&stale));
    assert!(fs::exists(&current));
    assert!(fs::exists(&unversioned));
}

#[test]
fn reentry_is_fatal_and_keeps_the_marker() {
    let workspace = Workspace::new(&[("m1", LEAF)]);
    let graph = workspace.resolve("m1");
    let module = graph.module(graph.target());
    let artifact =
        layout::artifact_dir(&workspace.artifacts_dir, module.name(), module.version()).unwrap();

    let build_dir = layout::interface_build_dir(&artifact, LibraryType::Shared).unwrap();
    std::fs::create_dir_all(&build_dir).unwrap();
    let marker = build_dir.join(&rel(".in_progress")).unwrap();
    std::fs::write(&marker, b"").unwrap();

    let toolchain = ToolchainConfig::default();
    let builder =
        ModuleBuilder::new(&graph, graph.target(), workspace.artifacts_dir.clone(), &toolchain);
    let err = builder
        .run_phase(graph.target(), Phase::ExportInterface, Some(LibraryType::Shared))
        .unwrap_err();

    assert!(err.to_string().contains("re-entry detected"));
    // the re-entry guard fires outside the phase's rollback scope
    assert!(fs::exists(&marker));
}

#[test]
fn completed_phase_wins_over_a_leftover_marker() {
    let workspace = Workspace::new(&[("m1", LEAF)]);
    let graph = workspace.resolve("m1");
    let module = graph.module(graph.target());
    let artifact =
        layout::artifact_dir(&workspace.artifacts_dir, module.name(), module.version()).unwrap();

    let build_dir = layout::interface_build_dir(&artifact, LibraryType::Shared).unwrap();
    let install_dir =
        layout::interface_install_dir(&artifact, LibraryType::Shared, module.name()).unwrap();
    std::fs::create_dir_all(&build_dir).unwrap();
    std::fs::create_dir_all(&install_dir).unwrap();
    std::fs::write(build_dir.join(&rel(".in_progress")).unwrap(), b"").unwrap();

    let toolchain = ToolchainConfig::default();
    let builder =
        ModuleBuilder::new(&graph, graph.target(), workspace.artifacts_dir.clone(), &toolchain);
    // the install tree marks completion, so the marker is never consulted
    builder
        .run_phase(graph.target(), Phase::ExportInterface, Some(LibraryType::Shared))
        .unwrap();
}

#[test]
fn failed_plugin_build_rolls_back_the_phase_subtree() {
    // the builder plugin cannot be built because the toolchain table points at a
    // binary that does not exist, so the phase must fail and leave no trace
    let workspace = Workspace::new(&[("m1", LEAF)]);
    let graph = workspace.resolve("m1");
    let module = graph.module(graph.target());
    let artifact =
        layout::artifact_dir(&workspace.artifacts_dir, module.name(), module.version()).unwrap();

    let toolchain = ToolchainConfig {
        compiler: AbsPath::new("/nonexistent/c++").unwrap(),
        archiver: AbsPath::new("/nonexistent/ar").unwrap(),
        make: AbsPath::new("/nonexistent/make").unwrap(),
    };
    let builder =
        ModuleBuilder::new(&graph, graph.target(), workspace.artifacts_dir.clone(), &toolchain);
    let err = builder
        .run_phase(graph.target(), Phase::ExportInterface, Some(LibraryType::Shared))
        .unwrap_err();

    assert!(err.to_string().contains("m1"));
    let phase_root = layout::phase_dir(&artifact, Phase::ExportInterface).unwrap();
    assert!(!fs::exists(&phase_root));
}

#[test]
fn versions_follow_source_changes() {
    let workspace = Workspace::new(&[("m1", LEAF)]);
    let first = workspace.resolve("m1").module(0).version();

    // a newer write under the module's source tree must produce a newer version
    let source = workspace.modules_dir.join(&rel("m1/builder.cpp")).unwrap();
    let later = std::time::SystemTime::now() + std::time::Duration::from_secs(30);
    let times = std::fs::FileTimes::new().set_modified(later);
    std::fs::File::options().write(true).open(&source).unwrap().set_times(times).unwrap();

    let second = workspace.resolve("m1").module(0).version();
    assert!(second > first);

    // the two versions map to disjoint artifact directories
    let dir_first = layout::artifact_dir(&workspace.artifacts_dir, "m1", first).unwrap();
    let dir_second = layout::artifact_dir(&workspace.artifacts_dir, "m1", second).unwrap();
    assert_ne!(dir_first, dir_second);
}

#[test]
fn diamond_graph_visits_every_component_once() {
    let workspace = Workspace::new(&[
        ("base", LEAF),
        ("left", r#"{"builder_deps": [], "module_deps": ["base"]}"#),
        ("right", r#"{"builder_deps": [], "module_deps": ["base"]}"#),
        ("top", r#"{"builder_deps": [], "module_deps": ["left", "right"]}"#),
    ]);
    let graph = workspace.resolve("top");

    assert_eq!(graph.sccs().len(), 4);
    let mut order = Vec::new();
    graph
        .visit_module_dep_sccs_topo(graph.target(), &mut |scc| {
            order.push(graph.module(scc.modules()[0]).name().to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], "base");
    assert_eq!(order[3], "top");
    let position =
        |name: &str| order.iter().position(|entry| entry == name).expect("visited");
    assert!(position("base") < position("left"));
    assert!(position("base") < position("right"));
}
