//! Request extractors shared by the HTTP and socket entry points.

pub mod auth;

pub use auth::{bearer_token, AuthUser};
