pub mod config;
pub mod errors;
pub mod frame;

pub use config::*;
pub use errors::*;
pub use frame::*;
