// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all)]
#![deny(rustdoc::all)]

//! Local address and port allocation for full-NAT forwarding.
//!
//! A full-NAT virtual server rewrites both legs of a flow, so every new
//! client connection needs a `<lip, lport>` source endpoint towards the real
//! server. The four-tuple `<lip:lport, rip:rport>` must stay unique across
//! millions of concurrent flows; a single local IP caps out near 2^16
//! sessions per destination, so services carry a pool of local addresses and
//! an allocator that rotates over them.
//!
//! The reply leg must also come back to the worker that owns the flow state
//! (connection tables are per worker). The NIC's filter table is small, so
//! the steering tag is either the low-order bits of the chosen port or the
//! local address itself; see [`steering`] for the trade-off.
//!
//! Module map:
//!
//! - [`steering`] — deployment mode and worker enable-mask
//! - [`iface`] — interface name resolution
//! - [`sapool`] — the `<lip, lport>` pool contract and its in-memory model
//! - [`pool`] — per-service local-address pool with round-robin selection
//! - [`bind`] — binding/unbinding connections to local endpoints
//! - [`sockopt`] — control-plane add/del/flush/getall

pub mod bind;
pub mod iface;
pub mod pool;
pub mod sapool;
pub mod sockopt;
pub mod steering;

pub use bind::{ConnFlags, FnatConn, FnatEnv, Proto, SchedName, ServiceIdent, VirtualService};
pub use pool::{LaddrLease, LaddrPool, LaddrSnapshot, LocalAddress};
pub use sapool::{MemSaPool, SaPool, SaPoolError};
pub use steering::{PoolMode, SteeringCtx, WorkerId, WorkerMask};
