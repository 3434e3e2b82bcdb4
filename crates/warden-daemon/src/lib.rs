//! HTTP control surface for the Warden sandbox orchestrator.
//!
//! Transport, authentication, validation and error mapping only; all domain
//! logic lives in `warden-core`.

pub mod auth;
pub mod server;
pub mod telemetry;
