//! Client for a distributed object-storage cluster.
//!
//! Data objects are stored on a cluster of object storage daemons (osds).
//! Cluster membership and the mapping of objects onto daemons are described
//! by the osd map. This crate converts file-extent reads and writes into
//! object requests, tracks the pending requests, resubmits them to different
//! daemons when the cluster topology or data layout changes, and retries the
//! affected requests when the transport channel to a daemon is reset.
//!
//! # Architecture
//!
//! - [`OSDClient`]: request registry, dispatch and repair, caller facade
//! - [`OSDRequest`]: one in-flight object operation
//! - `OSDSession`: per-daemon connection plus the requests routed to it
//! - [`OSDMap`]: versioned topology snapshot with the placement primitives
//! - `transport`: the message transport and monitor-client seams

pub mod client;
pub mod completion;
pub mod error;
pub mod layout;
pub mod messages;
pub mod osdmap;
pub mod pool;
pub mod request;
pub mod session;
pub mod transport;
pub mod types;

pub use client::{OSDClient, OSDClientConfig};
pub use error::OSDClientError;
pub use osdmap::{Fsid, OSDMap, OSDMapIncremental};
pub use request::OSDRequest;
pub use transport::{Connection, Message, MonitorClient, Transport};
pub use types::{
    EntityAddr, EVersion, FileLayout, OsdFlags, PgId, SnapContext, UTime, Vino, NOSNAP,
};

pub type Result<T> = std::result::Result<T, OSDClientError>;
