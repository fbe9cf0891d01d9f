//! The C surface of the module-builder view.
//!
//! A builder plugin is foreign code: the only things crossing the boundary are the
//! three phase entry points the plugin exports,
//!
//! ```c
//! void module_builder__export_interface(const module_builder_view_t*, uint8_t);
//! void module_builder__export_libraries(const module_builder_view_t*, uint8_t);
//! void module_builder__import_libraries(const module_builder_view_t*);
//! ```
//!
//! and the view passed into them: a record of C function pointers plus an opaque
//! context pointer, laid out here as [`ModuleBuilderView`]. Paths travel as
//! NUL-terminated heap strings freed through the paired `*_free` pointers; list
//! results travel as heap arrays with explicit lengths.
//!
//! Failure crosses the boundary through the view's error slot: any operation that
//! fails records a message and returns null (or a negative status), and a plugin can
//! record its own failure through `fail`. After the entry point returns, a set slot
//! is treated by the phase driver exactly like a thrown exception: rollback and
//! propagate. Trampolines catch Rust panics and divert them into the same slot, so
//! no unwind ever crosses the foreign frame.

use crate::{
    builder::ModuleBuilder,
    layout::{LibraryType, Phase},
    loader::SharedLibrary,
    path::{AbsPath, RelPath},
    ForgeError, Result,
};
use std::{
    cell::RefCell,
    ffi::{c_char, c_void, CStr, CString},
    os::unix::ffi::OsStrExt,
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
    ptr,
};

/// A heap list of NUL-terminated paths.
#[repr(C)]
pub struct PathList {
    pub paths: *mut *mut c_char,
    pub len: usize,
}

/// One link group: libraries that must be presented to the linker together.
#[repr(C)]
pub struct PathGroup {
    pub paths: *mut *mut c_char,
    pub len: usize,
}

/// A heap list of link groups, dependency groups first.
#[repr(C)]
pub struct PathGroupList {
    pub groups: *mut PathGroup,
    pub len: usize,
}

struct ViewCtx<'a> {
    builder: &'a ModuleBuilder<'a>,
    error: RefCell<Option<String>>,
}

impl ViewCtx<'_> {
    fn set_error(&self, detail: impl Into<String>) {
        let detail = detail.into();
        // the first failure wins; later ones are usually fallout
        self.error.borrow_mut().get_or_insert(detail);
    }
}

/// The view handed to every plugin entry point.
///
/// The field order is the ABI; plugins index this struct by a mirrored C declaration
/// and any change here is a breaking protocol change.
#[repr(C)]
pub struct ModuleBuilderView {
    ctx: *const c_void,

    modules_dir: extern "C" fn(*const ModuleBuilderView) -> *mut c_char,
    artifacts_dir: extern "C" fn(*const ModuleBuilderView) -> *mut c_char,
    source_dir: extern "C" fn(*const ModuleBuilderView) -> *mut c_char,
    artifact_dir: extern "C" fn(*const ModuleBuilderView) -> *mut c_char,
    artifact_alias_dir: extern "C" fn(*const ModuleBuilderView) -> *mut c_char,
    builder_source_path: extern "C" fn(*const ModuleBuilderView) -> *mut c_char,

    interface_build_dir: extern "C" fn(*const ModuleBuilderView, u8) -> *mut c_char,
    interface_install_dir: extern "C" fn(*const ModuleBuilderView, u8) -> *mut c_char,
    libraries_build_dir: extern "C" fn(*const ModuleBuilderView, u8) -> *mut c_char,
    libraries_install_dir: extern "C" fn(*const ModuleBuilderView, u8) -> *mut c_char,
    import_build_dir: extern "C" fn(*const ModuleBuilderView) -> *mut c_char,
    import_install_dir: extern "C" fn(*const ModuleBuilderView) -> *mut c_char,

    export_interfaces: extern "C" fn(*const ModuleBuilderView, u8) -> *mut PathList,
    export_libraries: extern "C" fn(*const ModuleBuilderView, u8) -> *mut PathGroupList,
    import_libraries: extern "C" fn(*const ModuleBuilderView) -> i32,

    install_interface:
        extern "C" fn(*const ModuleBuilderView, *const c_char, *const c_char, u8) -> i32,
    install_library:
        extern "C" fn(*const ModuleBuilderView, *const c_char, *const c_char, u8) -> i32,
    install_import: extern "C" fn(*const ModuleBuilderView, *const c_char, *const c_char) -> i32,

    fail: extern "C" fn(*const ModuleBuilderView, *const c_char),

    string_free: extern "C" fn(*mut c_char),
    path_list_free: extern "C" fn(*mut PathList),
    path_group_list_free: extern "C" fn(*mut PathGroupList),
}

impl ModuleBuilderView {
    fn new(ctx: &ViewCtx<'_>) -> Self {
        Self {
            ctx: ctx as *const ViewCtx<'_> as *const c_void,
            modules_dir: view_modules_dir,
            artifacts_dir: view_artifacts_dir,
            source_dir: view_source_dir,
            artifact_dir: view_artifact_dir,
            artifact_alias_dir: view_artifact_alias_dir,
            builder_source_path: view_builder_source_path,
            interface_build_dir: view_interface_build_dir,
            interface_install_dir: view_interface_install_dir,
            libraries_build_dir: view_libraries_build_dir,
            libraries_install_dir: view_libraries_install_dir,
            import_build_dir: view_import_build_dir,
            import_install_dir: view_import_install_dir,
            export_interfaces: view_export_interfaces,
            export_libraries: view_export_libraries,
            import_libraries: view_import_libraries,
            install_interface: view_install_interface,
            install_library: view_install_library,
            install_import: view_install_import,
            fail: view_fail,
            string_free: view_string_free,
            path_list_free: view_path_list_free,
            path_group_list_free: view_path_group_list_free,
        }
    }
}

/// Resolves and invokes the entry point of `phase`, converting a recorded failure
/// back into an error.
pub(crate) fn invoke_entry(
    library: &SharedLibrary,
    phase: Phase,
    builder: &ModuleBuilder<'_>,
    library_type: Option<LibraryType>,
) -> Result<()> {
    let ctx = ViewCtx { builder, error: RefCell::new(None) };
    let view = ModuleBuilderView::new(&ctx);

    unsafe {
        match phase {
            Phase::ImportLibraries => {
                let entry = library
                    .resolve::<unsafe extern "C" fn(*const ModuleBuilderView)>(
                        phase.entry_symbol(),
                    )?;
                entry(&view);
            }
            Phase::ExportInterface | Phase::ExportLibraries => {
                let library_type = library_type.ok_or_else(|| {
                    ForgeError::msg(format!("phase {phase} requires a library type"))
                })?;
                let entry = library
                    .resolve::<unsafe extern "C" fn(*const ModuleBuilderView, u8)>(
                        phase.entry_symbol(),
                    )?;
                entry(&view, library_type as u8);
            }
        }
    }

    match ctx.error.into_inner() {
        Some(detail) => Err(ForgeError::Plugin {
            path: library.path().as_std_path().into(),
            detail: format!("{} failed: {detail}", phase.entry_symbol()),
        }),
        None => Ok(()),
    }
}

unsafe fn view_ctx<'v>(view: *const ModuleBuilderView) -> &'v ViewCtx<'v> {
    &*((*view).ctx as *const ViewCtx<'v>)
}

fn alloc_c_string(ctx: &ViewCtx<'_>, path: &AbsPath) -> *mut c_char {
    match CString::new(path.as_std_path().as_os_str().as_bytes()) {
        Ok(string) => string.into_raw(),
        Err(_) => {
            ctx.set_error(format!("path contains an interior NUL: {path}"));
            ptr::null_mut()
        }
    }
}

/// Runs a fallible view operation, funnelling errors and panics into the error slot.
fn guard<T>(
    view: *const ModuleBuilderView,
    null: T,
    f: impl FnOnce(&ViewCtx<'_>) -> Result<T>,
) -> T {
    let ctx = unsafe { view_ctx(view) };
    match catch_unwind(AssertUnwindSafe(|| f(ctx))) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            ctx.set_error(err.to_string());
            null
        }
        Err(_) => {
            ctx.set_error("panicked inside a view operation");
            null
        }
    }
}

fn decode_library_type(raw: u8) -> Result<LibraryType> {
    LibraryType::from_raw(raw)
        .ok_or_else(|| ForgeError::msg(format!("unknown library type tag {raw}")))
}

unsafe fn decode_path<'a>(raw: *const c_char, what: &str) -> Result<&'a Path> {
    if raw.is_null() {
        return Err(ForgeError::msg(format!("{what} is null")))
    }
    let bytes = CStr::from_ptr(raw).to_bytes();
    Ok(Path::new(std::ffi::OsStr::from_bytes(bytes)))
}

macro_rules! view_path_getter {
    ($name:ident, |$builder:ident| $body:expr) => {
        extern "C" fn $name(view: *const ModuleBuilderView) -> *mut c_char {
            guard(view, ptr::null_mut(), |ctx| {
                let $builder = ctx.builder;
                let path: AbsPath = $body;
                Ok(alloc_c_string(ctx, &path))
            })
        }
    };
}

macro_rules! view_typed_path_getter {
    ($name:ident, |$builder:ident, $library_type:ident| $body:expr) => {
        extern "C" fn $name(view: *const ModuleBuilderView, raw: u8) -> *mut c_char {
            guard(view, ptr::null_mut(), |ctx| {
                let $builder = ctx.builder;
                let $library_type = decode_library_type(raw)?;
                let path: AbsPath = $body;
                Ok(alloc_c_string(ctx, &path))
            })
        }
    };
}

view_path_getter!(view_modules_dir, |builder| builder.modules_dir().clone());
view_path_getter!(view_artifacts_dir, |builder| builder.artifacts_dir().clone());
view_path_getter!(view_source_dir, |builder| builder.source_dir().clone());
view_path_getter!(view_artifact_dir, |builder| builder.artifact_dir()?);
view_path_getter!(view_artifact_alias_dir, |builder| builder.artifact_alias_dir()?);
view_path_getter!(view_builder_source_path, |builder| builder.builder_source_path()?);
view_path_getter!(view_import_build_dir, |builder| builder.import_build_dir()?);
view_path_getter!(view_import_install_dir, |builder| builder.import_install_dir()?);

view_typed_path_getter!(view_interface_build_dir, |builder, library_type| {
    builder.interface_build_dir(library_type)?
});
view_typed_path_getter!(view_interface_install_dir, |builder, library_type| {
    builder.interface_install_dir(library_type)?
});
view_typed_path_getter!(view_libraries_build_dir, |builder, library_type| {
    builder.libraries_build_dir(library_type)?
});
view_typed_path_getter!(view_libraries_install_dir, |builder, library_type| {
    builder.libraries_install_dir(library_type)?
});

fn alloc_path_array(ctx: &ViewCtx<'_>, paths: &[AbsPath]) -> Result<(*mut *mut c_char, usize)> {
    let mut raw = Vec::with_capacity(paths.len());
    for path in paths {
        let string = alloc_c_string(ctx, path);
        if string.is_null() {
            for earlier in raw {
                view_string_free(earlier);
            }
            return Err(ForgeError::msg("failed to encode path list"))
        }
        raw.push(string);
    }
    let mut slice = raw.into_boxed_slice();
    let pointer = slice.as_mut_ptr();
    let len = slice.len();
    std::mem::forget(slice);
    Ok((pointer, len))
}

extern "C" fn view_export_interfaces(view: *const ModuleBuilderView, raw: u8) -> *mut PathList {
    guard(view, ptr::null_mut(), |ctx| {
        let library_type = decode_library_type(raw)?;
        let include_dirs = ctx.builder.export_interfaces(library_type)?;
        let (paths, len) = alloc_path_array(ctx, &include_dirs)?;
        Ok(Box::into_raw(Box::new(PathList { paths, len })))
    })
}

extern "C" fn view_export_libraries(
    view: *const ModuleBuilderView,
    raw: u8,
) -> *mut PathGroupList {
    guard(view, ptr::null_mut(), |ctx| {
        let library_type = decode_library_type(raw)?;
        let library_groups = ctx.builder.export_libraries(library_type)?;
        let mut groups = Vec::with_capacity(library_groups.len());
        for group in &library_groups {
            let (paths, len) = alloc_path_array(ctx, group)?;
            groups.push(PathGroup { paths, len });
        }
        let mut slice = groups.into_boxed_slice();
        let pointer = slice.as_mut_ptr();
        let len = slice.len();
        std::mem::forget(slice);
        Ok(Box::into_raw(Box::new(PathGroupList { groups: pointer, len })))
    })
}

extern "C" fn view_import_libraries(view: *const ModuleBuilderView) -> i32 {
    guard(view, -1, |ctx| {
        ctx.builder.import_libraries()?;
        Ok(0)
    })
}

extern "C" fn view_install_interface(
    view: *const ModuleBuilderView,
    artifact: *const c_char,
    relative: *const c_char,
    raw: u8,
) -> i32 {
    guard(view, -1, |ctx| {
        let library_type = decode_library_type(raw)?;
        let artifact = AbsPath::new(unsafe { decode_path(artifact, "artifact path")? })?;
        let relative = RelPath::new(unsafe { decode_path(relative, "install path")? })?;
        ctx.builder.install_interface(&artifact, &relative, library_type)?;
        Ok(0)
    })
}

extern "C" fn view_install_library(
    view: *const ModuleBuilderView,
    artifact: *const c_char,
    relative: *const c_char,
    raw: u8,
) -> i32 {
    guard(view, -1, |ctx| {
        let library_type = decode_library_type(raw)?;
        let artifact = AbsPath::new(unsafe { decode_path(artifact, "artifact path")? })?;
        let relative = RelPath::new(unsafe { decode_path(relative, "install path")? })?;
        ctx.builder.install_library(&artifact, &relative, library_type)?;
        Ok(0)
    })
}

extern "C" fn view_install_import(
    view: *const ModuleBuilderView,
    artifact: *const c_char,
    relative: *const c_char,
) -> i32 {
    guard(view, -1, |ctx| {
        let artifact = AbsPath::new(unsafe { decode_path(artifact, "artifact path")? })?;
        let relative = RelPath::new(unsafe { decode_path(relative, "install path")? })?;
        ctx.builder.install_import(&artifact, &relative)?;
        Ok(0)
    })
}

extern "C" fn view_fail(view: *const ModuleBuilderView, message: *const c_char) {
    let ctx = unsafe { view_ctx(view) };
    let detail = if message.is_null() {
        "plugin signalled failure".to_string()
    } else {
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    };
    ctx.set_error(detail);
}

extern "C" fn view_string_free(string: *mut c_char) {
    if !string.is_null() {
        drop(unsafe { CString::from_raw(string) });
    }
}

fn free_path_array(paths: *mut *mut c_char, len: usize) {
    if paths.is_null() {
        return
    }
    let slice = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(paths, len)) };
    for &string in slice.iter() {
        view_string_free(string);
    }
}

extern "C" fn view_path_list_free(list: *mut PathList) {
    if list.is_null() {
        return
    }
    let list = unsafe { Box::from_raw(list) };
    free_path_array(list.paths, list.len);
}

extern "C" fn view_path_group_list_free(list: *mut PathGroupList) {
    if list.is_null() {
        return
    }
    let list = unsafe { Box::from_raw(list) };
    if list.groups.is_null() {
        return
    }
    let groups = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(list.groups, list.len)) };
    for group in groups.iter() {
        free_path_array(group.paths, group.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resolver::ModuleGraph, toolchain::ToolchainConfig};
    use pretty_assertions::assert_eq;

    fn workspace(tmp: &tempfile::TempDir) -> (AbsPath, AbsPath) {
        let root = AbsPath::new(tmp.path()).unwrap();
        let modules = root.join(&RelPath::new("modules").unwrap()).unwrap();
        let artifacts = root.join(&RelPath::new("artifacts").unwrap()).unwrap();
        let m1 = modules.join(&RelPath::new("m1").unwrap()).unwrap();
        std::fs::create_dir_all(&m1).unwrap();
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(m1.join(&RelPath::new("builder.cpp").unwrap()).unwrap(), b"").unwrap();
        std::fs::write(
            m1.join(&RelPath::new("deps.json").unwrap()).unwrap(),
            br#"{"builder_deps": [], "module_deps": []}"#,
        )
        .unwrap();
        (modules, artifacts)
    }

    fn read_and_free(view: &ModuleBuilderView, raw: *mut c_char) -> String {
        assert!(!raw.is_null());
        let string = unsafe { CStr::from_ptr(raw) }.to_str().unwrap().to_string();
        (view.string_free)(raw);
        string
    }

    #[test]
    fn path_getters_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let (modules, artifacts) = workspace(&tmp);
        let mut graph = ModuleGraph::discover(&modules, "m1").unwrap();
        graph.condense();
        graph.propagate_versions(1);
        let toolchain = ToolchainConfig::default();
        let builder = ModuleBuilder::new(&graph, graph.target(), artifacts.clone(), &toolchain);

        let ctx = ViewCtx { builder: &builder, error: RefCell::new(None) };
        let view = ModuleBuilderView::new(&ctx);

        assert_eq!(read_and_free(&view, (view.modules_dir)(&view)), modules.to_string());
        assert_eq!(read_and_free(&view, (view.artifacts_dir)(&view)), artifacts.to_string());
        let artifact_dir = read_and_free(&view, (view.artifact_dir)(&view));
        assert!(artifact_dir.contains("m1@"));
        let install =
            read_and_free(&view, (view.interface_install_dir)(&view, LibraryType::Shared as u8));
        assert!(install.ends_with("interface/shared/install/m1"));
        assert!(ctx.error.borrow().is_none());
    }

    #[test]
    fn bad_library_type_sets_error_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let (modules, artifacts) = workspace(&tmp);
        let mut graph = ModuleGraph::discover(&modules, "m1").unwrap();
        graph.condense();
        graph.propagate_versions(1);
        let toolchain = ToolchainConfig::default();
        let builder = ModuleBuilder::new(&graph, graph.target(), artifacts, &toolchain);

        let ctx = ViewCtx { builder: &builder, error: RefCell::new(None) };
        let view = ModuleBuilderView::new(&ctx);

        assert!((view.interface_build_dir)(&view, 9).is_null());
        assert!(ctx.error.borrow().as_deref().unwrap().contains("unknown library type"));
    }

    #[test]
    fn install_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let (modules, artifacts) = workspace(&tmp);
        let mut graph = ModuleGraph::discover(&modules, "m1").unwrap();
        graph.condense();
        graph.propagate_versions(1);
        let toolchain = ToolchainConfig::default();
        let builder = ModuleBuilder::new(&graph, graph.target(), artifacts, &toolchain);

        let ctx = ViewCtx { builder: &builder, error: RefCell::new(None) };
        let view = ModuleBuilderView::new(&ctx);

        let artifact = CString::new(tmp.path().join("modules/m1/builder.cpp").to_str().unwrap())
            .unwrap();
        let escape = CString::new("../../outside").unwrap();
        let status = (view.install_import)(&view, artifact.as_ptr(), escape.as_ptr());
        assert_eq!(status, -1);
        assert!(ctx.error.borrow().is_some());
    }

    #[test]
    fn fail_records_plugin_message() {
        let tmp = tempfile::tempdir().unwrap();
        let (modules, artifacts) = workspace(&tmp);
        let mut graph = ModuleGraph::discover(&modules, "m1").unwrap();
        graph.condense();
        graph.propagate_versions(1);
        let toolchain = ToolchainConfig::default();
        let builder = ModuleBuilder::new(&graph, graph.target(), artifacts, &toolchain);

        let ctx = ViewCtx { builder: &builder, error: RefCell::new(None) };
        let view = ModuleBuilderView::new(&ctx);

        let message = CString::new("missing input header").unwrap();
        (view.fail)(&view, message.as_ptr());
        // the first recorded failure wins
        let second = CString::new("fallout").unwrap();
        (view.fail)(&view, second.as_ptr());
        assert_eq!(ctx.error.borrow().as_deref(), Some("missing input header"));
    }
}
