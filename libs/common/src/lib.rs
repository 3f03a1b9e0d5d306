//! Shared building blocks for service binaries
//!
//! - `api_types`: JSON response envelope and `AppError`
//! - `bootstrap_args`: command-line arguments common to every service
//! - `logging`: tracing subscriber setup
//! - `shutdown`: signal handling

pub mod api_types;
pub mod bootstrap_args;
pub mod logging;
pub mod shutdown;

pub use api_types::{AppError, ErrorResponse, SuccessResponse};
pub use shutdown::wait_for_shutdown;
