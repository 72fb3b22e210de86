//! # Switchyard
//! Clustered request/response services for Rust.
//!
//! This is a convenience package which includes all of the sub-projects within
//! Switchyard, realistically you probably only want one of them:
//!
//! ### Features
//! - `rpc` - A framed, multiplexed RPC runtime with a bounded server worker pool.
//! - `node` - Registry backed cluster membership, load balancing and pooled
//!   request routing built on top of `rpc`.

#[cfg(feature = "switchyard-node")]
pub use switchyard_node as node;
#[cfg(feature = "switchyard-rpc")]
pub use switchyard_rpc as rpc;
