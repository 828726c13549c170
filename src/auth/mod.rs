//! Authentication: JWT pairs, password hashing, and session management.

pub mod jwt;
pub mod password;
pub mod service;

pub use jwt::{JwtError, JwtService};
pub use password::{hash_password, verify_password};
pub use service::{AuthError, AuthService, TokenPair};
