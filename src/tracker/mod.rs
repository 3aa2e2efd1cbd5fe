//! Tracker Role
//!
//! The coordination service: group/server registry, leader election among
//! trackers, and store/fetch routing for clients.

pub mod leader;
pub mod registry;
pub mod select;
pub mod server;
pub mod snapshot;

pub use leader::TrackerCluster;
pub use registry::Registry;
pub use select::{FetchSelection, StoreSelection, StoreSelector};
pub use server::TrackerServer;
