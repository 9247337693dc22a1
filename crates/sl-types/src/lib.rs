pub mod config;
pub mod errors;
pub mod job;

pub use config::*;
pub use errors::*;
pub use job::*;
