//! Resource types of the hosted control plane API
//!
//! Only the fields the harness reads or writes are modelled. Everything else
//! a server returns is kept in `extra` maps so a read-modify-write round trip
//! never drops fields this crate does not know about.

mod hosted_cluster;
mod hosted_control_plane;
mod node_pool;
mod types;

pub use hosted_cluster::*;
pub use hosted_control_plane::*;
pub use node_pool::*;
pub use types::*;
