//! Shared service helpers: endpoint bookkeeping and telemetry wiring.

pub mod endpoints;
pub mod health;
pub mod telemetry;

pub use endpoints::*;
pub use health::*;
pub use telemetry::*;
