//! Boundary surface consumed by transports such as the CLI.
//!
//! Versioned modules (currently `v1`) keep the contract stable while the
//! implementation behind it changes.

pub mod v1;
