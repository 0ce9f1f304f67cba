//! Access control: authentication, address filtering and rate limiting

mod auth;
mod rate_limit;

pub use auth::{AuthError, AuthGuard, IpRule};
pub use rate_limit::{ClientIdentity, RateLimiter};
