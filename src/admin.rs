use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Manager,
    Viewer,
}

/// The authenticated caller, as established from a bearer token. `None`
/// anywhere upstream means the request carried no usable token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: u64,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum InviteError {
    #[error("missing or invalid bearer token")]
    Unauthenticated,
    #[error("caller {0} is not a super admin")]
    Forbidden(u64),
    #[error("no user found for {0}")]
    UserNotFound(String),
    #[error("identity provider rejected the request: {0}")]
    ProviderFailure(String),
}

impl InviteError {
    pub fn status_code(&self) -> u16 {
        match self {
            InviteError::Unauthenticated => 401,
            InviteError::Forbidden(_) => 403,
            InviteError::UserNotFound(_) => 404,
            InviteError::ProviderFailure(_) => 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitedUser {
    pub provider_user_id: String,
    pub email: String,
}

/// The directory that actually holds user accounts and sends invite
/// emails. Lookup and resend are separate so a missing user is
/// distinguishable from a provider outage.
pub trait IdentityProvider {
    /// Returns `Ok(None)` when no account exists for the email.
    fn find_user_by_email(&self, email: &str) -> Result<Option<InvitedUser>, String>;
    fn resend_invite(&self, provider_user_id: &str) -> Result<(), String>;
}

/// Re-sends the onboarding invite for a user, restricted to super admins.
pub fn resend_user_invite(
    caller: Option<&Caller>,
    email: &str,
    provider: &dyn IdentityProvider,
) -> Result<InvitedUser, InviteError> {
    let caller = caller.ok_or(InviteError::Unauthenticated)?;
    if caller.role != Role::SuperAdmin {
        warn!(
            "User {} attempted invite resend for {} without super admin role",
            caller.user_id, email
        );
        return Err(InviteError::Forbidden(caller.user_id));
    }

    let user = provider
        .find_user_by_email(email)
        .map_err(InviteError::ProviderFailure)?
        .ok_or_else(|| InviteError::UserNotFound(email.to_string()))?;

    provider
        .resend_invite(&user.provider_user_id)
        .map_err(InviteError::ProviderFailure)?;

    info!("Invite re-sent to {} by user {}", email, caller.user_id);
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct FakeProvider {
        users: BTreeMap<String, InvitedUser>,
        lookup_fails: bool,
        resend_fails: bool,
    }

    impl FakeProvider {
        fn with_user(email: &str) -> Self {
            let mut users = BTreeMap::new();
            users.insert(
                email.to_string(),
                InvitedUser {
                    provider_user_id: "usr_123".to_string(),
                    email: email.to_string(),
                },
            );
            Self {
                users,
                lookup_fails: false,
                resend_fails: false,
            }
        }

        fn empty() -> Self {
            Self {
                users: BTreeMap::new(),
                lookup_fails: false,
                resend_fails: false,
            }
        }
    }

    impl IdentityProvider for FakeProvider {
        fn find_user_by_email(&self, email: &str) -> Result<Option<InvitedUser>, String> {
            if self.lookup_fails {
                return Err("upstream timeout".to_string());
            }
            Ok(self.users.get(email).cloned())
        }

        fn resend_invite(&self, _provider_user_id: &str) -> Result<(), String> {
            if self.resend_fails {
                return Err("invite quota exceeded".to_string());
            }
            Ok(())
        }
    }

    fn super_admin() -> Caller {
        Caller {
            user_id: 1,
            role: Role::SuperAdmin,
        }
    }

    #[test]
    fn test_missing_token_is_401() {
        let provider = FakeProvider::with_user("a@dealer.com");
        let err = resend_user_invite(None, "a@dealer.com", &provider).unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn test_non_super_admin_is_403() {
        let provider = FakeProvider::with_user("a@dealer.com");
        let caller = Caller {
            user_id: 7,
            role: Role::Admin,
        };
        let err = resend_user_invite(Some(&caller), "a@dealer.com", &provider).unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_unknown_user_is_404() {
        let provider = FakeProvider::empty();
        let err =
            resend_user_invite(Some(&super_admin()), "ghost@dealer.com", &provider).unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(err.to_string().contains("ghost@dealer.com"));
    }

    #[test]
    fn test_provider_failure_is_400() {
        let mut provider = FakeProvider::with_user("a@dealer.com");
        provider.resend_fails = true;
        let err = resend_user_invite(Some(&super_admin()), "a@dealer.com", &provider).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_lookup_failure_is_400_not_404() {
        let mut provider = FakeProvider::with_user("a@dealer.com");
        provider.lookup_fails = true;
        let err = resend_user_invite(Some(&super_admin()), "a@dealer.com", &provider).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_super_admin_resend_succeeds() {
        let provider = FakeProvider::with_user("a@dealer.com");
        let user = resend_user_invite(Some(&super_admin()), "a@dealer.com", &provider).unwrap();
        assert_eq!(user.provider_user_id, "usr_123");
    }
}
