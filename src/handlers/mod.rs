pub mod batch;
pub mod cache;
pub mod config;
pub mod transcribe;

pub use batch::*;
pub use cache::*;
pub use config::*;
pub use transcribe::*;
