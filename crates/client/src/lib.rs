//! Network edge for posa-offline.
//!
//! This crate provides the request model, the reqwest-backed fetch client
//! and the versioned cache controller that intercepts requests between the
//! page and the origin.

pub mod controller;
pub mod fetch;
pub mod network;
pub mod request;

pub use controller::{
    ActivateReport, CacheController, CacheGeneration, ClientMessage, ControlMessage, ControllerConfig, InstallReport,
    Interception, LifecycleState, ResponseSource,
};
pub use fetch::{FetchClient, FetchConfig};
pub use network::Network;
pub use request::{CacheMode, Destination, Request, RequestMode};
