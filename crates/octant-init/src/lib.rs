//! octant-init - process 1 for octant nodes.
//!
//! The binary boots the node in five phases, supervises the services it
//! launched, and on a shutdown signal stops them in reverse and performs the
//! terminal action (reboot, halt or power off).
//!
//! # Runtime Requirements
//!
//! The boot sequencer and the emergency shell block; run them on a blocking
//! thread when inside a Tokio runtime. The supervision task and shutdown path
//! are async and expect a multi-threaded runtime.
//!
//! # Modules
//!
//! - [`boot`]: the five-phase boot sequence and boot state
//! - [`platform`]: mounts, hostname, entropy, reboot and the emergency shell
//! - [`state`]: shared init state
//! - [`supervise`]: child reaping and runtime record pruning
//! - [`signals`]: the shutdown signal mapping
//! - [`shutdown`]: reverse sequencing
//! - [`emergency`]: the emergency fallback

pub mod boot;
pub mod emergency;
pub mod platform;
pub mod shutdown;
pub mod signals;
pub mod state;
pub mod supervise;
