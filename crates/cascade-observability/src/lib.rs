pub mod logging;
pub mod trace;

pub use logging::*;
pub use trace::*;
