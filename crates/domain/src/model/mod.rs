//! Data structures and helpers shared across the API, monitor and storage
//! crates.

mod donation;
mod events;
mod network;

pub use donation::*;
pub use events::*;
pub use network::*;
