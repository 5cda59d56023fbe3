//! Control plane of the VLAN-aware XDP redirector.
//!
//! One XDP program instance is attached to every input interface. It
//! classifies frames by VLAN tag and redirects them to an output interface
//! according to a per-input redirect map. This crate:
//!
//! - [`config`]: parses and validates the JSON topology file
//! - [`loader`]: prepares interfaces, attaches programs and programs maps
//! - [`dataplane`]: the aya-backed program attachment and map access
//! - [`link`]: interface flags, counters and VLAN offloads over rtnetlink
//! - [`topology`]: the in-memory interface/VLAN graph
//! - [`stats`], [`sampler`]: counter history, deltas, moving average
//! - [`scheduler`]: the fixed-interval sampling driver
//! - [`selector`], [`snapshot`]: what the display side reads
//!
//! # Lifecycle
//!
//! 1. Validate the topology file into a [`TopologyDescription`]
//! 2. [`AppState::bootstrap`] resolves, prepares and attaches everything
//! 3. [`Scheduler::run`] samples until shutdown or a sampling failure
//! 4. [`AppState::cleanup`] detaches every program

pub mod config;
pub mod dataplane;
pub mod error;
pub mod link;
pub mod loader;
pub mod sampler;
pub mod scheduler;
pub mod selector;
pub mod shell;
pub mod snapshot;
pub mod state;
pub mod stats;
pub mod topology;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{Settings, TopologyDescription, TopologyFile};
pub use dataplane::{Attachments, EngineLoader, RedirectMaps, XdpEngineLoader};
pub use error::{Result, VlanRedirError};
pub use link::{LinkControl, LinkStatus, NetlinkLinkControl};
pub use sampler::StatisticsEngine;
pub use scheduler::Scheduler;
pub use selector::Selector;
pub use snapshot::{EntityView, Snapshot};
pub use state::{AppState, Navigation, SharedState};
pub use stats::{format_size, History, Sample};
pub use topology::{EntityRef, HasHistory, Topology};
pub use types::{DisplayMode, VlanId, XdpMode};
