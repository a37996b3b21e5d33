//! tms-auth: access tokens, password hashing and tenant identity resolution.

pub mod jwt;
pub mod options;
pub mod password;
pub mod resolver;

pub use jwt::{extract_bearer_token, AccessTokenSubject, JwtProvider, TokenClaims, TokenService};
pub use options::{AuthOptions, JwtAlgorithm, JwtOptions, PasswordOptions, DEVELOPMENT_SECRET};
pub use password::{hash_password, verify_password};
pub use resolver::TenantIdentityResolver;
