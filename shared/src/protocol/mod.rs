//! Persisted trace format
//!
//! A trace is an append-only stream of framed records. Large binaries live
//! beside it in a content store (see [`crate::store`]).

pub mod wire;
