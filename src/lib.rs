//! Modular C++ build orchestration.
//!
//! Each subdirectory of a workspace is a *module* whose build rules are themselves
//! C++ source: a `builder.cpp` compiled into a shared-object plugin co-located with
//! the module, next to a `deps.json` naming the modules it depends on. The
//! orchestrator discovers the module graph, condenses module-dep cycles into
//! strongly connected components, propagates a content-derived version through the
//! condensed DAG, and then drives every module through the three plugin phases
//! (*export-interface*, *export-libraries*, *import-libraries*), caching each
//! phase's outputs in a versioned artifact tree.
//!
//! The high-level entry point is [`Orchestrator`]; the pieces compose from the
//! bottom up:
//!
//! - [`path`] and [`fs`]: containment-checked path values and filesystem services;
//! - [`process`] and [`loader`]: subprocess spawning and shared-object loading;
//! - [`toolchain`]: the compile/archive/link façade over the system C++ toolchain;
//! - [`manifest`] and [`resolver`]: `deps.json` parsing and the module graph;
//! - [`layout`]: the versioned artifact tree;
//! - [`builder`] and [`api`]: the phase driver and the plugin-facing C surface.

#![deny(unused_must_use, rust_2018_idioms)]
#![warn(rustdoc::all)]

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod error;

pub mod api;
pub mod builder;
pub mod fs;
pub mod layout;
pub mod loader;
pub mod manifest;
pub mod orchestrator;
pub mod path;
pub mod process;
pub mod resolver;
pub mod toolchain;
pub mod utils;

pub use builder::ModuleBuilder;
pub use error::{ForgeError, ForgeIoError, Result};
pub use layout::{LibraryType, Phase};
pub use manifest::ModuleManifest;
pub use orchestrator::Orchestrator;
pub use path::{AbsPath, RelPath};
pub use resolver::{ModuleGraph, ModuleId, SccId};
pub use toolchain::ToolchainConfig;
