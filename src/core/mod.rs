//! Core packet queue and divert rule functionality
//!
//! - [`session`]: queue session, packet dispatch and verdicts
//! - [`queue`]: kernel queue transport over netfilter netlink
//! - [`classify`]: which queued packets reach the callback
//! - [`attr`]: netlink attribute codec and conntrack id decoding
//! - [`nft`] / [`ipt`]: divert rule generation
//! - [`backend`]: applying and removing rules through nft or iptables
//! - [`exec`]: locating and spawning the firewall tools
//! - [`policy`]: session policy and queue/mark parameters
//! - [`error`]: error types

pub mod attr;
pub mod backend;
pub mod classify;
pub mod error;
pub mod exec;
pub mod ipt;
pub mod nft;
pub mod policy;
pub mod queue;
pub mod session;

#[cfg(test)]
pub mod test_helpers;
