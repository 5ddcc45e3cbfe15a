//! Serialization utilities shared by system crates.

pub mod terminated_bytes;
