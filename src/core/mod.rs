pub mod types;
pub mod crypto;
pub mod transaction;
pub mod message;

pub use types::*;
