pub mod agent;
pub mod config;
pub mod error;
pub mod graph;
pub mod persistence;
pub mod services;
pub mod streaming;
pub mod types;

#[cfg(feature = "api")]
pub mod api;

pub use error::{GraphError, GraphResult};
