//! dfs-names - logical file naming and coordination utilities for a
//! distributed file directory.
//!
//! The crate covers the canonical logical-file-name layer (parsing,
//! validation, normalization, rendering, brace-list unions, external
//! paths, foreign references), the compact binary codec for per-part
//! file metadata with the shrink/expand tree transform, and three
//! services built over a hierarchical coordination store: paged sorted
//! queries with a session-keyed result cache, a cluster-wide named
//! mutex, and a versioned name-redirection table.
//!
//! The store itself is a trait seam ([`store::CoordStore`]); an
//! in-memory implementation ([`store::memory::MemoryStore`]) backs the
//! tests and demos.

pub mod config;
pub mod dmutex;
pub mod endpoint;
pub mod filetree;
pub mod lfn;
pub mod paged;
pub mod partattr;
pub mod redirect;
pub mod store;
pub mod tree;
