//! arkfleet: provision and orchestrate ARK: Survival Ascended server clusters
//!
//! - `cluster`: planning (ports, mods, server specs), the config store and the
//!   service every mutation goes through
//! - `runtime`: artifacts, the process supervisor seam, lifecycle, backups,
//!   logs, binaries and background jobs
//! - `server`: the REST API
//! - `config`: manager configuration and cluster request files
//! - `cli`: command-line parsing and output formatting

pub mod cli;
pub mod cluster;
pub mod config;
pub mod runtime;
pub mod server;
