//! Admin token utility for billsync
//!
//! Mints an HS256 admin token for the finance routes, signed with
//! `ADMIN_JWT_SECRET`. Used by operators and the dashboard's service account.
//!
//! Usage:
//!   cargo run --bin issue-admin-token -- <admin-user-uuid> <email> [role]
//!
//! The token carries the `finance` permission and expires after 8 hours.

use std::env;

use uuid::Uuid;

use billsync_api::auth::{JwtManager, FINANCE_PERMISSION};
use billsync_api::state::ADMIN_TOKEN_EXPIRY_HOURS;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut args = env::args().skip(1);
    let (Some(user_id), Some(email)) = (args.next(), args.next()) else {
        eprintln!("Usage: issue-admin-token <admin-user-uuid> <email> [role]");
        std::process::exit(1);
    };
    let role = args.next().unwrap_or_else(|| "admin".to_string());

    let user_id: Uuid = user_id
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid admin user id: {}", e))?;

    let secret = env::var("ADMIN_JWT_SECRET")
        .map_err(|_| anyhow::anyhow!("ADMIN_JWT_SECRET must be set"))?;
    if secret.len() < 32 {
        anyhow::bail!("ADMIN_JWT_SECRET must be at least 32 characters");
    }

    let jwt = JwtManager::new(&secret, ADMIN_TOKEN_EXPIRY_HOURS);
    let token = jwt.generate_token(user_id, &email, &role, &[FINANCE_PERMISSION])?;

    println!("{}", token);
    Ok(())
}
