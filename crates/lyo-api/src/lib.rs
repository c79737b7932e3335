//! Authenticated JSON request pipeline for the Lyo API
//!
//! Every call is signed by the shared `SessionManager`. A 401 triggers one
//! token refresh and one retry; everything else is classified into the typed
//! [`Error`] without retrying at this layer.

pub mod config;
pub mod error;
pub mod pipeline;

pub use config::{PipelineConfig, build_http_client};
pub use error::{Error, Result, UserAction};
pub use pipeline::RequestPipeline;
