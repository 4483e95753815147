//! The compliance review domain: resource types, cache keys, endpoints and
//! reviewer actions, wired onto the sync engine.

mod client;
mod keys;
mod operations;
mod service;
pub mod types;

pub use client::ComplianceClient;
pub use keys::{ComplianceQuery, Domain};
pub use operations::{
  AssignCase, AssignInput, ResolveCase, ResolveInput, ReviewApplicant, ReviewInput,
};
pub use service::{ComplianceSync, PollIntervals};
