pub mod cli;
pub mod document;

pub use cli::*;
pub use document::*;
