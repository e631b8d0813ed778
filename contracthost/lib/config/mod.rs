//! Configuration types, defaults and loading.

mod defaults;
mod host;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use host::*;
