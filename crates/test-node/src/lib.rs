#![allow(missing_docs)]

//! # Test Node
//!
//! An in-memory [`dwn_core::provider::Provider`] implementation for tests
//! and examples: a deterministic Ed25519 key store, a `did:key` resolver,
//! a block store, a sorted key-value store, and a broadcast-backed event
//! stream.

pub mod key_store;
pub mod provider;
