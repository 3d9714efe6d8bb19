//! HTTP surface and server bootstrap

pub mod router;
pub mod server;

pub use router::{create_router, AppState};
pub use server::Bridge;
