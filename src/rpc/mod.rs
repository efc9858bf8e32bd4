mod handlers;
mod server;
mod types;

pub use handlers::AppState;
pub use server::{router, serve, RpcServer};
pub use types::*;
