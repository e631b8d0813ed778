//! Command-line interface of the `contracthost` binary.

mod args;
mod seed;
mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use seed::*;
pub use styles::*;
