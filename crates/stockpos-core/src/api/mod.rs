//! Authenticated access to the application API.

mod client;
mod queue;
mod request;

pub use client::{ApiClient, ApiError, ApiResult};
pub use queue::{PendingQueue, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_QUEUE_TIMEOUT};
pub use request::{ApiRequest, AuthenticatedRequest};
