//! octant-core - vertices, membranes and chirality for the octant init system.
//!
//! Every service on an octant node is classified into one of eight fixed
//! isolation profiles ([`vertex::Vertex`]). A service runs inside a
//! *membrane*: a cgroup v2 grouping with resource limits, a set of Linux
//! namespaces erected before exec, and a reduced capability bounding set.
//! Membranes can be stretched and contracted while the service keeps running.
//!
//! The system-wide *chirality* bit selects whether the four
//! development-polarity vertices (debug and observability tooling) run
//! alongside production services.
//!
//! # Modules
//!
//! - [`vertex`]: the closed vertex enum and its compiled-in profile table
//! - [`config`]: TOML configuration and service declarations
//! - [`size`]: memory size parsing (`128M`, `2G`, ...)
//! - [`store`]: persisted runtime state (filesystem and in-memory)
//! - [`cgroup`]: the cgroup v2 tree backing membranes
//! - [`process`]: isolated process launch and liveness probes
//! - [`membrane`]: the membrane lifecycle controller
//! - [`chirality`]: mode state and the flip protocol
//! - [`error`]: the shared error taxonomy

pub mod cgroup;
pub mod chirality;
pub mod config;
pub mod error;
pub mod membrane;
pub mod process;
pub mod size;
pub mod store;
pub mod vertex;

pub use chirality::{Chirality, ChiralityController, FlipTarget};
pub use error::{OctantError, Result};
pub use membrane::MembraneController;
pub use vertex::Vertex;
