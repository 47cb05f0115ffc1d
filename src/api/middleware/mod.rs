mod cors;
mod rate_limit;

pub use cors::cors_layer;
pub use rate_limit::{rate_limit_middleware, Admission, RateLimiter};
