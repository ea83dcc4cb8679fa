//! Shared primitives for the norsu crates.
//!
//! Everything in here is `no_std`; the `std` feature only widens the test
//! surface of downstream crates.

#![cfg_attr(not(feature = "std"), no_std)]

/// Bit and byte reordering helpers.
pub mod bits;
/// CRC-32 checksum wrapper.
pub mod crc;
/// Endian-tagged scalar types for on-flash structures.
pub mod endian;
