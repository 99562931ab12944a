//! Core library of the Chorus multi-provider orchestrator.
//!
//! One user turn flows through these modules:
//! - [`router`] sequences a turn: routing decision, then a direct reply or a fan-out.
//! - [`context`] owns the master transcript, per-provider histories and routing.
//! - [`agents`] holds the provider gateways, their configuration and the fan-out orchestrator.
//! - [`aggregator`] synthesises the mean and best answers from a fan-out.
//! - [`app`] wires everything once at startup; [`api`] is the boundary contract.
//! - [`db`] initialises SQLite and the conversation storage.
//! - [`errors`] keeps the error catalogue with human friendly metadata.
//! - [`logging`] writes structured diagnostics to the event log table.

pub mod agents;
pub mod aggregator;
pub mod api;
pub mod app;
pub mod context;
pub mod db;
pub mod errors;
pub mod logging;
pub mod router;
