//! stargate - randomized-source egress for SOCKS5 proxying.
//!
//! This crate provides:
//! - `permute`: O(1)-space pseudo-random permutations of integer ranges
//! - `subnet`: prefix arithmetic over the /k subnets of a CIDR block
//! - `dialer`: the random-source dialer tying permutation to egress
//! - `egress`: leak-safe bind+verify connections with freebind support
//! - `conflicts`: the startup broadcast-address pre-scan
//! - `proxy`: a SOCKS5 server that egresses through the dialer
//!
//! # Example
//!
//! ```rust,ignore
//! use stargate::dialer::RandomIpDialer;
//! use stargate::egress::Transport;
//!
//! let dialer = RandomIpDialer::new("2001:db8::/48".parse()?, 64)?;
//! let conn = dialer.dial(Transport::Tcp, target).await?;
//! // conn is bound to a random, verified source inside 2001:db8::/48
//! ```

pub mod conflicts;
pub mod dialer;
pub mod egress;
pub mod permute;
pub mod proxy;
pub mod resolver;
pub mod subnet;

// Re-export the types most callers need at the crate root.
pub use conflicts::check_host_conflicts;
pub use dialer::{ConfigError, EgressDial, RandomIpDialer};
pub use egress::{EgressConn, EgressError, Transport};
