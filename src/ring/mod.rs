//! Consistent Hashing
//!
//! Keys are spread across servers with a ketama-style continuum:
//!
//! ```text
//!   0                                                        2^32
//!   |----A----B--A-----C---B------C--A---------B----C-----A----|
//!                ^
//!                crc32(key) lands here: owned by the largest
//!                point at or before it (A), wrapping to the end
//! ```
//!
//! Each server gets `points_per_server * servers * weight / total_weight`
//! points, so a weight-2 server owns about twice the key space of a
//! weight-1 server. When the owner is down, the key is rehashed as
//! `"{attempt}{key}"` up to 20 times to find a live alternate; adding or
//! removing a server only moves the keys adjacent to its points.

pub mod continuum;
pub mod hash_ring;

pub use continuum::{key_hash, point_hash, Continuum, Entry};
pub use hash_ring::{
    Ring, RingError, RingMember, DEFAULT_POINTS_PER_SERVER, MAX_LOOKUP_ATTEMPTS,
};
