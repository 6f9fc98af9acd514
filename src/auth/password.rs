//! Password-based SSH authentication.

use async_trait::async_trait;

use crate::error::Result;
use crate::session::Session;

use super::accepted;
use super::traits::AuthStrategy;

/// Password authentication strategy.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(&self, session: &Session) -> Result<bool> {
        let status = session.userauth_password(&self.password).await?;
        Ok(accepted(status))
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_auth_name() {
        let auth = PasswordAuth::new("secret");
        assert_eq!(auth.name(), "password");
    }

    #[test]
    fn test_password_auth_from_string() {
        let auth = PasswordAuth::new(String::from("secret"));
        assert_eq!(auth.password, "secret");
    }

    #[tokio::test]
    async fn test_unconnected_session_is_an_error() {
        let session = Session::loopback();
        session.set_user("ci").unwrap();
        let auth = PasswordAuth::new("secret");
        assert!(auth.authenticate(&session).await.is_err());
    }
}
