//! Types shared by the Homer user API crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, constant_time_eq, resolve_secret};
