pub mod auth;
pub mod error_handling;
pub mod guards;

pub use auth::{Claims, Identity, JwtVerifier};
pub use guards::AuthenticatedUser;
