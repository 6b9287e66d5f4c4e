//! ParseWiz client core: the preview/export orchestrator for JSON, CSV and Excel
//! files, and the resource cache policy that fronts the web client.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod proxy;
pub mod session;

pub use error::{Result, ToolkitError};
