// Application layer - use cases and orchestration on top of a Store.

pub mod error;
pub mod retry;
pub mod service;

pub use error::*;
pub use retry::*;
pub use service::*;
