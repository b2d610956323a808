//! Shared vocabulary for the edgefleet workspace.
//!
//! Wire types exchanged between the control-plane, host agents, and operator tooling live here so
//! both ends of every protocol agree on field names and enum spellings.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
