//! Where portal credentials come from

use async_trait::async_trait;

use crate::config::PortalConfig;
use crate::utils::errors::{RpaError, RpaResult};

/// What a full login needs to fill the form
#[derive(Clone)]
pub struct Credentials {
    pub identity: String,
    pub secret: String,
    pub tenant_id: Option<String>,
    pub login_url: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("login_url", &self.login_url)
            .finish()
    }
}

#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Credentials for `target`; absence is a [`RpaError::Configuration`]
    async fn credentials(&self, target: &str) -> RpaResult<Credentials>;
}

/// Credentials fixed at startup from config and `PORTAL_*` env vars
pub struct StaticCredentials {
    user: Option<String>,
    password: Option<String>,
    tenant_id: Option<String>,
    login_url: String,
}

impl StaticCredentials {
    pub fn from_portal(portal: &PortalConfig) -> Self {
        Self {
            user: portal.user.clone(),
            password: portal.password.clone(),
            tenant_id: portal.tenant_id.clone(),
            login_url: portal.login_url.clone(),
        }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self, target: &str) -> RpaResult<Credentials> {
        let missing = |what: &str| {
            RpaError::Configuration(format!("No portal {} configured for '{}'", what, target))
        };
        let identity = self
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| missing("user"))?;
        let secret = self
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| missing("password"))?;

        Ok(Credentials {
            identity,
            secret,
            tenant_id: self.tenant_id.clone().filter(|t| !t.is_empty()),
            login_url: self.login_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_password_is_a_configuration_error() {
        let mut portal = PortalConfig::default();
        portal.user = Some("taller@example.com".into());
        let provider = StaticCredentials::from_portal(&portal);

        let err = provider.credentials("default").await.unwrap_err();
        assert!(matches!(err, RpaError::Configuration(msg) if msg.contains("password")));
    }

    #[tokio::test]
    async fn debug_output_hides_the_secret() {
        let mut portal = PortalConfig::default();
        portal.user = Some("taller@example.com".into());
        portal.password = Some("hunter2".into());
        let creds = StaticCredentials::from_portal(&portal)
            .credentials("default")
            .await
            .unwrap();
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
