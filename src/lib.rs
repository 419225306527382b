#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate
)]
// now allow a few rules which are denied by the above's statement
#![allow(clippy::multiple_crate_versions)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::all)]

//! vxhcid: an emulated xHCI USB 3.0 host controller for virtual machines,
//! with host pass-through via port mapping and an internal tablet.

pub mod async_runtime;
pub mod cli;
pub mod device;
pub mod hotplug_protocol;
pub mod hotplug_server;
