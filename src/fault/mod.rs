//! Fault Injection
//!
//! Controlled disruptions applied to a live cluster while its volumes are
//! being observed. Faults run inline or in the background through a
//! [`FaultHandle`].

mod injector;

pub use injector::{FaultHandle, FaultInjector};
