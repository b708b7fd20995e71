//! Middleware and routing links.

mod logger;
mod retry;
mod split;

pub use logger::LoggerLink;
pub use retry::{RetryLink, RetryPolicy};
pub use split::{is_subscription, SplitLink};
