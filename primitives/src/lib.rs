//! Fixed-capacity concurrent primitives for the statediff deduplicators.
//!
//! All three structures are sized once at construction and never
//! reallocate, so they can be shared by reference across a parallel
//! classification pass: the digest map resolves racing inserts without
//! locks, the append vector hands out slots with an atomic cursor, and
//! the bitset sets bits with atomic word ops. Exhausting a pinned
//! capacity is reported, never grown past.

mod append_vec;
mod bitset;
mod digest_map;
mod error;

pub use append_vec::AppendVec;
pub use bitset::AtomicBitset;
pub use digest_map::{DigestMap, InsertOutcome};
pub use error::CapacityError;
