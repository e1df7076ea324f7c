//! Record-store contracts implemented by the storage crate.

mod traits;

pub use traits::*;
