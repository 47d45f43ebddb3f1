//! Fail-fast cancellation for a build run.

mod token;

pub use token::CancellationToken;
