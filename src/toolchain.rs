//! Invocations of the system C++ toolchain.
//!
//! A thin façade over the compiler, archiver and make binaries: compile translation
//! units into an object cache mirroring the source tree, then archive or link them.
//! Every invocation logs its full command line before running; any non-zero exit is
//! fatal and names the output that failed to materialize.

use crate::{
    fs,
    path::AbsPath,
    process::{self, Arg},
    ForgeError, Result,
};
use once_cell::sync::Lazy;

/// Absolute paths of the toolchain binaries.
///
/// This table is the only place system-specific paths enter the build system; no
/// environment variable is consulted.
#[derive(Clone, Debug)]
pub struct ToolchainConfig {
    pub compiler: AbsPath,
    pub archiver: AbsPath,
    pub make: AbsPath,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            compiler: AbsPath::from_normalized("/usr/bin/c++".into()),
            archiver: AbsPath::from_normalized("/usr/bin/ar".into()),
            make: AbsPath::from_normalized("/usr/bin/make".into()),
        }
    }
}

static DEFAULT: Lazy<ToolchainConfig> = Lazy::new(ToolchainConfig::default);

/// The process-wide default toolchain table.
pub fn default_toolchain() -> &'static ToolchainConfig {
    &DEFAULT
}

/// A preprocessor definition passed as `-D<name>=<value>`.
pub type Define = (String, String);

fn run(args: &[Arg], output: &AbsPath) -> Result<()> {
    match process::spawn_and_wait(args)? {
        0 => Ok(()),
        status if status > 0 => {
            Err(ForgeError::Toolchain { output: output.as_std_path().into(), status })
        }
        status => Err(ForgeError::ToolchainSignal {
            output: output.as_std_path().into(),
            signal: -status,
        }),
    }
}

fn ensure_parent(path: &AbsPath) -> Result<()> {
    let parent = path.parent()?;
    if !fs::exists(&parent) {
        fs::create_directories(&parent)?;
    }
    Ok(())
}

fn ensure_output(path: AbsPath) -> Result<AbsPath> {
    if !fs::exists(&path) {
        return Err(ForgeError::msg(format!(
            "expected output \"{path}\" to exist but it does not"
        )))
    }
    Ok(path)
}

/// Compiles each source into an object file under `cache_dir`, mirroring the source
/// tree rooted at `source_root`. Returns the object paths in source order.
pub fn compile_objects(
    config: &ToolchainConfig,
    cache_dir: &AbsPath,
    source_root: &AbsPath,
    include_dirs: &[AbsPath],
    sources: &[AbsPath],
    defines: &[Define],
    position_independent: bool,
) -> Result<Vec<AbsPath>> {
    if !fs::exists(cache_dir) {
        fs::create_directories(cache_dir)?;
    }

    let mut prefix: Vec<Arg> = vec![Arg::from(&config.compiler), "-g".into(), "-std=c++23".into()];
    for (name, value) in defines {
        prefix.push(format!("-D{name}={value}").into());
    }
    for include_dir in include_dirs {
        prefix.push(format!("-I{include_dir}").into());
    }

    let mut objects = Vec::with_capacity(sources.len());
    for source in sources {
        if !fs::exists(source) {
            return Err(ForgeError::msg(format!("source file does not exist \"{source}\"")))
        }

        let relative = source_root.relative(source)?;
        let object = cache_dir.join(&relative)?.with_extension("o")?;
        ensure_parent(&object)?;

        let mut args = prefix.clone();
        if position_independent {
            args.push("-fPIC".into());
        }
        args.extend(["-c".into(), Arg::from(source), "-o".into(), Arg::from(&object)]);
        run(&args, &object)?;

        objects.push(object);
    }
    Ok(objects)
}

/// Compiles the sources (non-PIC) and archives them into `output`.
pub fn create_static_library(
    config: &ToolchainConfig,
    cache_dir: &AbsPath,
    source_root: &AbsPath,
    include_dirs: &[AbsPath],
    sources: &[AbsPath],
    defines: &[Define],
    output: &AbsPath,
) -> Result<AbsPath> {
    let objects =
        compile_objects(config, cache_dir, source_root, include_dirs, sources, defines, false)?;
    ensure_parent(output)?;

    let mut args: Vec<Arg> = vec![Arg::from(&config.archiver), "rcs".into(), Arg::from(output)];
    args.extend(objects.iter().map(Arg::from));
    run(&args, output)?;

    ensure_output(output.clone())
}

/// Compiles the sources (PIC) and links them as a shared object, appending
/// `extra_dsos` to the link line.
pub fn create_shared_library(
    config: &ToolchainConfig,
    cache_dir: &AbsPath,
    source_root: &AbsPath,
    include_dirs: &[AbsPath],
    sources: &[AbsPath],
    defines: &[Define],
    extra_dsos: &[AbsPath],
    output: &AbsPath,
) -> Result<AbsPath> {
    let objects =
        compile_objects(config, cache_dir, source_root, include_dirs, sources, defines, true)?;
    ensure_parent(output)?;

    let mut args: Vec<Arg> =
        vec![Arg::from(&config.compiler), "-g".into(), "-shared".into(), "-o".into(), Arg::from(output)];
    args.extend(objects.iter().map(Arg::from));
    for dso in extra_dsos {
        if !fs::exists(dso) {
            return Err(ForgeError::msg(format!("dso does not exist \"{dso}\"")))
        }
        args.push(dso.into());
    }
    run(&args, output)?;

    ensure_output(output.clone())
}

/// Compiles the sources and links the binary.
///
/// `library_groups` are consumed in reverse order (deepest dependency last, per unix
/// link semantics); a group larger than one is wrapped in start/end group markers so
/// intra-group circular references resolve, unless every link input is shared. Every
/// consumed library contributes an rpath entry pointing at its directory.
pub fn create_binary(
    config: &ToolchainConfig,
    cache_dir: &AbsPath,
    source_root: &AbsPath,
    include_dirs: &[AbsPath],
    sources: &[AbsPath],
    defines: &[Define],
    library_groups: &[Vec<AbsPath>],
    all_shared: bool,
    output: &AbsPath,
) -> Result<AbsPath> {
    let objects = compile_objects(
        config,
        cache_dir,
        source_root,
        include_dirs,
        sources,
        defines,
        all_shared,
    )?;
    ensure_parent(output)?;

    for library in library_groups.iter().flatten() {
        if !fs::exists(library) {
            return Err(ForgeError::msg(format!("library does not exist \"{library}\"")))
        }
    }

    let mut args: Vec<Arg> = vec![
        Arg::from(&config.compiler),
        "-g".into(),
        "-std=c++23".into(),
        "-o".into(),
        Arg::from(output),
    ];
    args.extend(objects.iter().map(Arg::from));
    args.extend(group_link_args(library_groups, all_shared)?);
    run(&args, output)?;

    ensure_output(output.clone())
}

/// Builds the library part of a binary link line: groups reversed, bracketed where
/// needed, followed by one rpath entry per library in original group order.
fn group_link_args(library_groups: &[Vec<AbsPath>], all_shared: bool) -> Result<Vec<Arg>> {
    let mut args = Vec::new();
    for group in library_groups.iter().rev() {
        let bracket = !all_shared && group.len() > 1;
        if bracket {
            args.push("-Wl,--start-group".into());
        }
        args.extend(group.iter().map(Arg::from));
        if bracket {
            args.push("-Wl,--end-group".into());
        }
    }
    for library in library_groups.iter().flatten() {
        args.push(format!("-Wl,-rpath,{}", library.parent()?).into());
    }
    Ok(args)
}
