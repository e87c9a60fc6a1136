//! Core engine: feed monitoring, qualification and purchase dispatch.
//!
//! - [`poller`] diffs polled DMarket snapshots
//! - [`stream`] consumes the Skinport sale feed
//! - [`executor`] buys and classifies the reply
//! - [`balance`] tracks the spendable balance

pub mod balance;
pub mod executor;
pub mod poller;
pub mod stream;
