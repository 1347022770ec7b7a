use thiserror::Error;

/// Failures the allocator reports to its callers. Contract violations
/// (removing a range that is not in a tree, unaligned sizes, double frees,
/// allocating from a condensing metaslab) are not represented here; they
/// panic.
#[derive(Debug, Error)]
pub enum AllocError {
    /// No allocation could be made in any eligible group after all retries.
    #[error("no space available in allocation class")]
    NoSpace,

    /// A space-map read failed; the caller surfaces pool degradation.
    #[error("space map i/o failure: {0}")]
    Io(anyhow::Error),

    /// On claim: the requested range is not currently free.
    #[error("range is not free")]
    NotFound,

    /// The DVA names a nonexistent vdev or an out-of-range metaslab.
    #[error("invalid dva: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, AllocError>;
