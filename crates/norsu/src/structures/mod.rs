//! On-flash metadata structures.
//!
//! Both tables are single 4 KiB blocks stored twice in flash. All scalar
//! fields are little-endian; the structs here are alignment-1 so they can be
//! cast straight out of a raw block.

pub mod cpb;
pub mod spt;

pub use cpb::Cpb;
pub use spt::Spt;
