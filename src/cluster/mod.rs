//! # Cluster planning and management
//!
//! A cluster is a named group of ARK servers that share save-data transfer
//! (`-clusterid`) and one port-numbering scheme.
//!
//! ```text
//!  ClusterRequest ──► ClusterPlanner ──► ClusterSpec ──► ConfigStore
//!                      │  ports::PortAllocator            │
//!                      │  mods::ModConfig                 ▼
//!                      └  server::build           runtime::artifacts
//! ```
//!
//! Every mutation goes through `ClusterService`, which serializes planning
//! so port assignments stay unique across the host.

pub mod mods;
pub mod planner;
pub mod ports;
pub mod resources;
pub mod server;
pub mod service;
pub mod store;

pub use mods::{ModConfig, ModError, ModId, ServerModOverride};
pub use planner::{plan, ClusterPlanner, ClusterRequest, ClusterSpec, MapSelection, PlanError, ServerOverride};
pub use ports::{PortAllocator, PortAssignment, PortConfig, PortError, PortKind, PortOverride};
pub use resources::{OperationStatus, ResourceList};
pub use server::{GameMap, ServerSpec, SpecError};
pub use service::{ApplyReport, ArtifactView, ClusterService, ServiceError};
pub use store::{ConfigStore, FileStore, MemoryStore, StoreError};
