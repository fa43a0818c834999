pub mod artifacts;
pub mod config;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod reducer;
pub mod registry;
pub mod state;
pub mod store;
pub mod url;

pub use error::{Recovered, Result, ServdeckError};
