//! Launch gate: fetches the routing decision for this install and decides
//! between the web destination, the notification prompt and the native app.

pub mod client;
pub mod config;
pub mod controller;
pub mod destination;
pub mod errors;
pub mod metrics_defs;
pub mod navigation;
pub mod notification_link;
pub mod policy;
pub mod push_token;
pub mod redirect;

#[cfg(test)]
mod testutils;

pub use client::{ConfigClient, DeviceContext, RemoteConfigResponse, RoutingSource};
pub use config::{Config, GateTimings};
pub use controller::{GateController, GateDeps, GateState, GateStatus};
pub use errors::{FetchError, GateError};
pub use policy::{NotificationGatePolicy, PermissionService, PermissionStatus};
