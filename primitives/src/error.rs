use thiserror::Error;

/// A fixed-capacity structure was asked to hold more than it was sized
/// for at construction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("capacity exhausted: {structure} pinned at {capacity} entries")]
pub struct CapacityError {
    pub structure: &'static str,
    pub capacity: usize,
}
