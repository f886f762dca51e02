#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Board domain: resource kinds, DTOs, the concrete repo
pub mod board;

/// Configuration options
pub mod config;

/// Structural diff between JSON snapshots
pub mod diff;

/// Error (common error types)
pub mod error;

/// Reactive value container producing patches
pub mod observable;

/// Patch and path primitives
pub mod patch;

/// Typed real-time event hub
pub mod socket;

/// Application-state store with command dispatch and undo
pub mod store;

/// Abstract optimistic synchronization engine
pub mod sync;

#[cfg(test)]
pub mod test_utils;

pub use error::{BoardsyncError, Result};
pub use observable::{MutationSource, Observable};
pub use patch::{Patch, PatchOp, Path, PathSegment};
