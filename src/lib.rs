//! Client-side synchronization for a compliance review dashboard.
//!
//! A [`QueryCache`](cache::QueryCache) holds server-owned resources. Three
//! things keep it honest:
//! - [`MutationCoordinator`](mutation::MutationCoordinator) applies reviewer
//!   actions optimistically and reconciles or rolls them back
//! - [`PushChannel`](push::PushChannel) turns server notifications into
//!   invalidations and writes
//! - [`Poller`](poller::Poller) refreshes long-running jobs until they finish
//!
//! [`compliance::ComplianceSync`] wires all of it onto the compliance API.

pub mod cache;
pub mod cancel;
pub mod client;
pub mod clock;
pub mod compliance;
pub mod credentials;
pub mod error;
pub mod mutation;
pub mod poller;
pub mod push;

#[cfg(test)]
mod testing;

pub use cancel::CancelSignal;
pub use error::{SyncError, SyncResult};
