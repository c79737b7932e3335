//! Types shared by the Lyo session crates: redacting secret wrapper,
//! RFC 7807 problem details, and the configuration error type.

mod error;
mod problem;
mod secret;

pub use error::{Error, Result};
pub use problem::ProblemDetails;
pub use secret::Secret;
