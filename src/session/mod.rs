//! Sessions, messages and their persistence

pub mod store;
pub mod types;

pub use store::SessionStore;
pub use types::*;
