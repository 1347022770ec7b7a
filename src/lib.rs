//! The space-allocation core of a copy-on-write storage pool: per-device
//! metaslab bookkeeping, the range-tree free-space representation, pluggable
//! in-metaslab placement strategies, and the allocation-class rotor that
//! spreads replicas across devices.
//!
//! The transactional block layer above calls [`Pool::alloc`], [`Pool::free`],
//! and [`Pool::claim`]; the syncing context drives [`Pool::sync`] once per
//! txg. Everything a metaslab knows about its allocation history lives in an
//! append-only space map log that reloads into a range tree and is condensed
//! when the log outgrows its minimal form.

pub mod base_types;
mod class;
pub mod config;
pub mod error;
mod group;
pub mod init;
mod metaslab;
pub mod mos;
mod pool;
pub mod range_tree;
pub mod space_map;
pub mod strategy;
pub mod taskq;
mod vdev;

pub use class::{ClassKind, MetaslabClass};
pub use config::AllocConfig;
pub use error::{AllocError, Result};
pub use group::MetaslabGroup;
pub use metaslab::{
    Metaslab, METASLAB_ACTIVE_MASK, METASLAB_WEIGHT_PRIMARY, METASLAB_WEIGHT_SECONDARY,
};
pub use pool::{AllocFlags, Pool};
pub use vdev::{Vdev, VdevState};
