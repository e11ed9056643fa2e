//! Admin authentication

pub mod jwt;
pub mod middleware;

pub use jwt::{AdminClaims, JwtManager, FINANCE_PERMISSION};
pub use middleware::{require_finance_admin, AdminUser};
