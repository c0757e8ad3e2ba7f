//! Infrastructure implementations of the OrbitMesh core ports.
//!
//! - `memory` -- the in-memory reference implementation of the store
//!   contract; relational backends implement the same traits behind their
//!   own connection plumbing
//! - `webhook` -- notifier port implementation delivering JSON webhooks

pub mod memory;
pub mod webhook;
