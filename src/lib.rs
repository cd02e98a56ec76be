//! `dockyard`: orchestrates heterogeneous container-based build pipelines
//! against a container daemon. Composes multi-container "systems" whose
//! lifecycles are coordinated by dependency order, then uses those systems
//! as ephemeral machinery to produce new container images — either by
//! committing a running container's state or by extracting a sibling
//! container's volume contents and rebuilding them into a fresh image. Also
//! produces plain single-container images from a flat resource/command
//! specification.
//!
//! Grounded throughout on `ASzc/nagoya` (a Python implementation of the same
//! system, kept in this repository's retrieval pack as reference material
//! only) and restructured along `Dauaaa-super_orchestrator`'s Rust idiom:
//! `stacked_errors` for fallible operations, `tracing` for structured
//! logging, `bollard` for the daemon client, explicit registries in place
//! of dynamic lookups. See `DESIGN.md` for the module-by-module grounding.

pub mod build_context;
pub mod build_driver;
pub mod callbacks;
pub mod config;
pub mod container;
pub mod daemon;
pub mod error;
pub mod file_options;
pub mod fleet;
mod misc;
pub mod planner;
pub mod temp_dir;

pub use misc::{
    acquire_dir_path, acquire_file_path, close_file, ctrlc_init, random_name, std_init,
    wait_for_ok, CTRLC_ISSUED,
};
