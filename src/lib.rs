pub mod api;
pub mod cipher;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod shutdown;
pub mod store;

pub use error::{RelayError, Result};
