//! Shared domain types for OrbitMesh.
//!
//! Plain serde-serializable records used across the engine, the store
//! implementations, and the agent session layer. This crate has no IO and no
//! async code -- it depends only on serialization and identifier crates.

pub mod agent;
pub mod config;
pub mod error;
pub mod instance;
pub mod job;
pub mod workflow;
