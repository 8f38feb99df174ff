use crate::consts;

/// Who is calling, as resolved by the upstream auth middleware.
///
/// Built once per request by the HTTP layer and passed explicitly to the
/// auth gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub is_api_key: bool,
    pub uid: Option<String>,
    pub roles: Vec<String>,
}

impl RequestIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn api_key() -> Self {
        Self {
            is_api_key: true,
            ..Default::default()
        }
    }

    pub fn user(uid: &str, roles: &[&str]) -> Self {
        Self {
            is_api_key: false,
            uid: Some(uid.to_string()),
            roles: roles.iter().map(|role| role.to_string()).collect(),
        }
    }

    pub fn is_superadmin(&self) -> bool {
        self.roles.iter().any(|role| role == consts::SUPERADMIN_ROLE)
    }

    pub fn is_anonymous(&self) -> bool {
        self.uid.as_deref().is_none_or(|uid| uid.trim().is_empty())
    }

    /// Key used to bucket the caller in the rate limiter
    pub fn rate_limit_key(&self) -> Option<String> {
        if self.is_anonymous() {
            return None;
        }
        self.uid.as_ref().map(|uid| format!("uid:{uid}"))
    }
}
