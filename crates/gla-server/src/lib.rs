//! HTTP front end for gla.
//!
//! `POST /analyze` runs an analysis synchronously or streams its state
//! transitions as Server-Sent Events. Concurrent identical requests share
//! one run through the [`Coordinator`]; each run gets a session token that
//! can be used to inspect, resume or cancel it.

pub mod coordinator;
pub mod error;
pub mod routes;
pub mod server;
pub mod session;

pub use coordinator::Coordinator;
pub use error::{ApiError, ApiResult};
pub use routes::{create_router, AppState};
pub use server::GlaServer;
pub use session::{RunKey, Session};
