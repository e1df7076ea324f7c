//! Domain-level building blocks shared across the API, monitor and storage
//! crates: configuration, the chain-operations data model, endpoint
//! bookkeeping and the record-store contracts.

pub mod config;
pub mod model;
pub mod services;
pub mod storage;

pub use model::*;
pub use storage::*;
