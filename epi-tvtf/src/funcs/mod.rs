pub mod epiforecast;
pub mod modellog;

pub use epiforecast::*;
pub use modellog::*;
