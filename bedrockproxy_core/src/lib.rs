//! Core engine for the bedrockproxy management daemon.
//!
//! Provides the UDP reverse proxy, the process supervisor, the JSON-backed
//! data store, the server manager that ties them together, and the
//! executable/properties detector used by the create-server flow.
//!
//! Note: each server record owns exactly one proxy and at most one
//! supervised process; there is no backend/load-balancer hierarchy here,
//! unlike the teacher this crate started from.

pub mod detector;
pub mod manager;
pub mod proxy_protocol;
pub mod store;
pub mod supervisor;
pub mod udp_proxy;

pub use manager::ServerManager;
pub use store::DataStore;
pub use supervisor::ProcessSupervisor;
pub use udp_proxy::UdpProxy;
