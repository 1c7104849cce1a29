pub mod client;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod node;
pub mod queue;
pub mod routing;
pub mod shutdown;
pub mod worker;

pub use error::{MultigrainError, Result};
