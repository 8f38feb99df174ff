use std::time::Duration;

/// Header carrying a token minted by the payment service
pub const FORWARDED_TOKEN_HEADER: &str = "X-Forwarded-From-Payment-Service";
/// `sub` a forwarded token must carry to be trusted
pub const TRUSTED_CALLER_SUBJECT: &str = "payment-service";

pub const IDENTITY_API_KEY_HEADER: &str = "X-Auth-Api-Key";
pub const IDENTITY_UID_HEADER: &str = "X-Auth-Uid";
pub const IDENTITY_ROLES_HEADER: &str = "X-Auth-Roles";
pub const SUPERADMIN_ROLE: &str = "superadmin";

/// Lifetime of every signed hop token
pub const TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

pub const DELIVERY_LOCK_KEY: &str = "hook-relay:delivery-worker";
/// Gap left between a lock expiring and the next tick
pub const LOCK_TTL_MARGIN: Duration = Duration::from_millis(500);
pub const MIN_LOCK_TTL: Duration = Duration::from_secs(1);

pub const MAX_SERVICE_NAME_LEN: usize = 256;
pub const JSON_CONTENT_TYPE: &str = "application/json";
