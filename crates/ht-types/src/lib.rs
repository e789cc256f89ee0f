pub mod config;
pub mod errors;
pub mod evaluation;
pub mod search;
pub mod trial;

pub use config::*;
pub use errors::*;
pub use evaluation::*;
pub use search::*;
pub use trial::*;
