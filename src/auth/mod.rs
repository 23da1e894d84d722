//! Authentication: session tokens bound to a socket at upgrade time.

mod jwt;

pub use jwt::{Claims, JwtSecret};
