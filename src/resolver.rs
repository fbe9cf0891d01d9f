//! Resolution of the module dependency graph for a workspace.
//!
//! Discovery starts at the requested target module and recursively follows the two
//! dependency lists of each `deps.json`: *builder* dependencies (a module whose plugin
//! is linked into the dependent's plugin) and *module* dependencies (a module whose
//! exported libraries the dependent's artifacts link against).
//!
//! Builder dependencies control link-time composition of plugin shared objects and
//! must form a DAG; a back-edge on that subgraph is fatal. Module dependencies may be
//! cyclic: Tarjan's algorithm condenses the module-dep subgraph into strongly
//! connected components, each of which becomes a single linkable unit. Component ids
//! are assigned in Tarjan emission order, which is reverse topological with respect to
//! module-dep edges: a component's module-dep dependencies always carry smaller ids.
//!
//! Each component then receives a propagated version: the maximum of the
//! orchestrator's own version, its members' source versions, and the propagated
//! versions of every component it depends on through either edge kind. All members of
//! a component share this version, which makes the versioned artifact directory of a
//! module a pure function of the graph.

use crate::{
    fs, layout,
    manifest::{ModuleManifest, DEPS_JSON},
    path::{AbsPath, RelPath},
    utils, ForgeError, Result,
};
use std::collections::{HashMap, HashSet};

/// Name of the orchestrator's own source module inside the workspace.
pub const BUILDER_MODULE_NAME: &str = "builder";

/// Index of a [`Module`] inside its owning [`ModuleGraph`].
pub type ModuleId = usize;

/// Index of an [`Scc`] inside its owning [`ModuleGraph`].
pub type SccId = usize;

/// One workspace subdirectory with `builder.cpp` and `deps.json`; the unit of build.
///
/// Created during discovery, versioned exactly once during propagation, never
/// destroyed during a run.
#[derive(Debug)]
pub struct Module {
    name: String,
    source_dir: AbsPath,
    source_version: u64,
    version: Option<u64>,
    builder_deps: Vec<ModuleId>,
    module_deps: Vec<ModuleId>,
    scc: Option<SccId>,
}

impl Module {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_dir(&self) -> &AbsPath {
        &self.source_dir
    }

    /// The maximum modification timestamp under the module's source tree.
    pub fn source_version(&self) -> u64 {
        self.source_version
    }

    /// The propagated version; available once versions were propagated.
    pub fn version(&self) -> u64 {
        self.version.expect("versions were propagated")
    }

    pub fn builder_deps(&self) -> &[ModuleId] {
        &self.builder_deps
    }

    pub fn module_deps(&self) -> &[ModuleId] {
        &self.module_deps
    }

    /// The component this module belongs to; available once the graph was condensed.
    pub fn scc(&self) -> SccId {
        self.scc.expect("graph was condensed")
    }
}

/// A strongly connected component of the module-dep subgraph.
#[derive(Debug)]
pub struct Scc {
    id: SccId,
    /// Member modules, ordered by name so bundles and traversals are stable.
    modules: Vec<ModuleId>,
    /// Components this one depends on through any edge kind, deduplicated, ascending.
    deps: Vec<SccId>,
    version: Option<u64>,
}

impl Scc {
    pub fn id(&self) -> SccId {
        self.id
    }

    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    pub fn deps(&self) -> &[SccId] {
        &self.deps
    }

    pub fn version(&self) -> u64 {
        self.version.expect("versions were propagated")
    }
}

/// The discovered module graph of one workspace, rooted at a target module.
///
/// Modules and components are owned by this container; all cross-references are
/// indices into it, which keeps the cyclic parts of the graph representable without
/// ownership cycles.
#[derive(Debug)]
pub struct ModuleGraph {
    modules_dir: AbsPath,
    modules: Vec<Module>,
    indices: HashMap<String, ModuleId>,
    target: ModuleId,
    sccs: Vec<Scc>,
}

impl ModuleGraph {
    /// Discovers all modules reachable from `target`, validating each `deps.json` and
    /// the presence of each module's directory and builder source.
    pub fn discover(modules_dir: &AbsPath, target: &str) -> Result<Self> {
        if !fs::exists(modules_dir) {
            return Err(ForgeError::Discovery(format!(
                "modules directory does not exist \"{modules_dir}\""
            )))
        }

        let mut graph = Self {
            modules_dir: modules_dir.clone(),
            modules: Vec::new(),
            indices: HashMap::new(),
            target: 0,
            sccs: Vec::new(),
        };
        graph.target = graph.discover_module(target)?;
        trace!(module = %target, modules = graph.modules.len(), "discovered module graph");
        Ok(graph)
    }

    fn discover_module(&mut self, name: &str) -> Result<ModuleId> {
        if let Some(id) = self.indices.get(name) {
            return Ok(*id)
        }

        let source_dir = RelPath::new(name)
            .and_then(|relative| self.modules_dir.join(&relative))
            .map_err(|_| ForgeError::Discovery(format!("invalid module name '{name}'")))?;
        if !fs::is_dir(&source_dir) {
            return Err(ForgeError::Discovery(format!(
                "module directory does not exist \"{source_dir}\""
            )))
        }
        let builder_source = source_dir.join(&RelPath::new(layout::BUILDER_SOURCE_FILE)?)?;
        if !fs::exists(&builder_source) {
            return Err(ForgeError::Discovery(format!(
                "module '{name}' is missing \"{builder_source}\""
            ))
            .for_module(name))
        }

        let source_version = utils::source_version(&source_dir)?;

        // register the module before reading its manifest so self-referential
        // module_deps resolve to this record instead of recursing forever
        let id = self.modules.len();
        self.indices.insert(name.to_string(), id);
        self.modules.push(Module {
            name: name.to_string(),
            source_dir: source_dir.clone(),
            source_version,
            version: None,
            builder_deps: Vec::new(),
            module_deps: Vec::new(),
            scc: None,
        });

        let manifest_path = source_dir.join(&RelPath::new(DEPS_JSON)?)?;
        let manifest = ModuleManifest::read(&manifest_path).map_err(|err| err.for_module(name))?;

        for dep in &manifest.builder_deps {
            let dep_id = self.discover_module(dep)?;
            self.modules[id].builder_deps.push(dep_id);
        }
        for dep in &manifest.module_deps {
            let dep_id = self.discover_module(dep)?;
            self.modules[id].module_deps.push(dep_id);
        }

        Ok(id)
    }

    pub fn modules_dir(&self) -> &AbsPath {
        &self.modules_dir
    }

    /// The target module this graph was rooted at.
    pub fn target(&self) -> ModuleId {
        self.target
    }

    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id]
    }

    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.indices.get(name).copied()
    }

    /// The orchestrator's own source module, if the workspace carries one.
    pub fn builder_module(&self) -> Option<ModuleId> {
        self.module_id(BUILDER_MODULE_NAME)
    }

    /// Returns an iterator over all modules and their ids, in discovery order.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &Module)> {
        self.modules.iter().enumerate()
    }

    pub fn scc(&self, id: SccId) -> &Scc {
        &self.sccs[id]
    }

    pub fn sccs(&self) -> &[Scc] {
        &self.sccs
    }

    /// Ensures the builder-dep subgraph reachable from the target is a DAG.
    ///
    /// A back-edge is fatal and reports the cycle's modules in stack order. The one
    /// exception is a self-edge of the orchestrator's own source module, which is how
    /// the orchestrator bootstraps from its own plugin.
    pub fn validate_builder_deps(&self) -> Result<()> {
        let mut visited = vec![false; self.modules.len()];
        let mut on_stack = vec![false; self.modules.len()];
        let mut stack = Vec::new();
        self.validate_builder_deps_from(self.target, &mut visited, &mut on_stack, &mut stack)
    }

    fn validate_builder_deps_from(
        &self,
        id: ModuleId,
        visited: &mut [bool],
        on_stack: &mut [bool],
        stack: &mut Vec<ModuleId>,
    ) -> Result<()> {
        if on_stack[id] {
            let mut cycle = Vec::new();
            for &entry in stack.iter().rev() {
                cycle.push(self.modules[entry].name.clone());
                if entry == id {
                    break
                }
            }
            return Err(ForgeError::BuilderDepCycle(cycle))
        }
        if visited[id] {
            return Ok(())
        }

        visited[id] = true;
        on_stack[id] = true;
        stack.push(id);

        for &dep in &self.modules[id].builder_deps {
            if dep == id && self.modules[id].name == BUILDER_MODULE_NAME {
                continue
            }
            self.validate_builder_deps_from(dep, visited, on_stack, stack)?;
        }

        stack.pop();
        on_stack[id] = false;
        Ok(())
    }

    /// Condenses the module-dep subgraph into strongly connected components.
    ///
    /// Every discovered module contributes to exactly one component; only module-dep
    /// edges are followed when forming components, while the condensed dependency
    /// edges between components are derived from both edge kinds.
    pub fn condense(&mut self) {
        debug_assert!(self.sccs.is_empty());

        let len = self.modules.len();
        let mut state = Tarjan {
            index: vec![usize::MAX; len],
            lowlink: vec![0; len],
            on_stack: vec![false; len],
            stack: Vec::new(),
            counter: 0,
            components: Vec::new(),
        };
        for id in 0..len {
            if state.index[id] == usize::MAX {
                state.strong_connect(&self.modules, id);
            }
        }

        for (scc_id, mut members) in state.components.into_iter().enumerate() {
            members.sort_by(|a, b| self.modules[*a].name.cmp(&self.modules[*b].name));
            for &member in &members {
                self.modules[member].scc = Some(scc_id);
            }
            self.sccs.push(Scc { id: scc_id, modules: members, deps: Vec::new(), version: None });
        }

        // condensed edges, deduplicated per component
        for scc_id in 0..self.sccs.len() {
            let mut seen = HashSet::new();
            let mut deps = Vec::new();
            for &member in &self.sccs[scc_id].modules {
                let module = &self.modules[member];
                for &dep in module.builder_deps.iter().chain(&module.module_deps) {
                    let dep_scc = self.modules[dep].scc.expect("all modules condensed");
                    if dep_scc != scc_id && seen.insert(dep_scc) {
                        deps.push(dep_scc);
                    }
                }
            }
            deps.sort_unstable();
            self.sccs[scc_id].deps = deps;
        }

        trace!(components = self.sccs.len(), "condensed module graph");
    }

    /// Propagates versions: every component receives the maximum of the orchestrator
    /// version, its members' source versions and its dependencies' propagated
    /// versions, and every member module receives its component's version.
    pub fn propagate_versions(&mut self, orchestrator_version: u64) {
        debug_assert!(!self.sccs.is_empty(), "graph was condensed");

        let mut visiting = vec![false; self.sccs.len()];
        for id in 0..self.sccs.len() {
            self.propagate_scc(id, orchestrator_version, &mut visiting);
        }

        for scc_id in 0..self.sccs.len() {
            let version = self.sccs[scc_id].version.expect("propagated above");
            for member in self.sccs[scc_id].modules.clone() {
                self.modules[member].version = Some(version);
            }
        }
    }

    fn propagate_scc(
        &mut self,
        id: SccId,
        orchestrator_version: u64,
        visiting: &mut [bool],
    ) -> u64 {
        if let Some(version) = self.sccs[id].version {
            return version
        }
        // a component can reach itself through a builder edge combined with module
        // edges; the re-entered frame contributes nothing
        if visiting[id] {
            return 0
        }
        visiting[id] = true;

        let mut version = orchestrator_version;
        for dep in self.sccs[id].deps.clone() {
            version = version.max(self.propagate_scc(dep, orchestrator_version, visiting));
        }
        for &member in &self.sccs[id].modules {
            version = version.max(self.modules[member].source_version);
        }

        visiting[id] = false;
        self.sccs[id].version = Some(version);
        version
    }

    /// Visits the components reachable from `start` in topological order: every
    /// component's dependencies are visited before the component itself.
    pub fn visit_sccs_topo(
        &self,
        start: SccId,
        f: &mut dyn FnMut(&Scc) -> Result<()>,
    ) -> Result<()> {
        let mut visited = vec![false; self.sccs.len()];
        self.visit_sccs_topo_from(start, f, &mut visited)
    }

    fn visit_sccs_topo_from(
        &self,
        id: SccId,
        f: &mut dyn FnMut(&Scc) -> Result<()>,
        visited: &mut [bool],
    ) -> Result<()> {
        if visited[id] {
            return Ok(())
        }
        visited[id] = true;
        for &dep in &self.sccs[id].deps {
            self.visit_sccs_topo_from(dep, f, visited)?;
        }
        f(&self.sccs[id])
    }

    /// Visits the components of the module-dep closure of `module` in topological
    /// order: the closure is restricted to module-dep edges, which is the traversal
    /// the export phases and link-group assembly are defined over.
    pub fn visit_module_dep_sccs_topo(
        &self,
        module: ModuleId,
        f: &mut dyn FnMut(&Scc) -> Result<()>,
    ) -> Result<()> {
        let mut visited = vec![false; self.sccs.len()];
        self.visit_module_dep_sccs_from(self.modules[module].scc(), f, &mut visited)
    }

    fn visit_module_dep_sccs_from(
        &self,
        id: SccId,
        f: &mut dyn FnMut(&Scc) -> Result<()>,
        visited: &mut [bool],
    ) -> Result<()> {
        if visited[id] {
            return Ok(())
        }
        visited[id] = true;

        let mut dep_sccs = Vec::new();
        let mut seen = HashSet::new();
        for &member in &self.sccs[id].modules {
            for &dep in &self.modules[member].module_deps {
                let dep_scc = self.modules[dep].scc();
                if dep_scc != id && seen.insert(dep_scc) {
                    dep_sccs.push(dep_scc);
                }
            }
        }
        dep_sccs.sort_unstable();

        for dep in dep_sccs {
            self.visit_module_dep_sccs_from(dep, f, visited)?;
        }
        f(&self.sccs[id])
    }
}

struct Tarjan {
    index: Vec<usize>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<ModuleId>,
    counter: usize,
    components: Vec<Vec<ModuleId>>,
}

impl Tarjan {
    fn strong_connect(&mut self, modules: &[Module], v: ModuleId) {
        self.index[v] = self.counter;
        self.lowlink[v] = self.counter;
        self.counter += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for &dep in &modules[v].module_deps {
            if self.index[dep] == usize::MAX {
                self.strong_connect(modules, dep);
                self.lowlink[v] = self.lowlink[v].min(self.lowlink[dep]);
            } else if self.on_stack[dep] {
                self.lowlink[v] = self.lowlink[v].min(self.index[dep]);
            }
        }

        if self.lowlink[v] == self.index[v] {
            let mut members = Vec::new();
            loop {
                let member = self.stack.pop().expect("v is on the stack");
                self.on_stack[member] = false;
                members.push(member);
                if member == v {
                    break
                }
            }
            self.components.push(members);
        }
    }
}
