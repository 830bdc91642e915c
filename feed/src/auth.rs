use std::future::Future;
use std::sync::{Arc, RwLock};

#[derive(thiserror::Error, Debug, Clone)]
pub enum AuthError {
    #[error("Credential unavailable: {0}")]
    Unavailable(String),
}

/// Bearer credential pair handed to the server in `setup`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access: String,
    pub refresh: String,
}

impl Credential {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

/// Supplies and rotates the credential used by the transport.
///
/// `refresh` is only called when the server pushes `refreshToken`.
pub trait AuthProvider: Send + Sync + 'static {
    fn credential(&self) -> Credential;

    fn refresh(&self) -> impl Future<Output = Result<Credential, AuthError>> + Send;
}

/// Provider backed by a fixed credential, e.g. tokens read from the environment.
///
/// A refresh hands back whatever is currently stored; `replace` lets the
/// owner rotate it out of band.
#[derive(Debug, Clone)]
pub struct StaticAuth {
    inner: Arc<RwLock<Credential>>,
}

impl StaticAuth {
    pub fn new(credential: Credential) -> Self {
        Self {
            inner: Arc::new(RwLock::new(credential)),
        }
    }

    pub fn replace(&self, credential: Credential) {
        match self.inner.write() {
            Ok(mut guard) => *guard = credential,
            Err(poisoned) => *poisoned.into_inner() = credential,
        }
    }
}

impl AuthProvider for StaticAuth {
    fn credential(&self) -> Credential {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn refresh(&self) -> Result<Credential, AuthError> {
        let credential = self.credential();
        if credential.access.is_empty() {
            return Err(AuthError::Unavailable("no access token".to_string()));
        }
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_auth_refresh_returns_replaced_credential() {
        let auth = StaticAuth::new(Credential::new("a1", "r1"));
        auth.replace(Credential::new("a2", "r2"));

        assert_eq!(auth.refresh().await.unwrap(), Credential::new("a2", "r2"));
    }

    #[tokio::test]
    async fn empty_access_token_cannot_refresh() {
        let auth = StaticAuth::new(Credential::new("", ""));
        assert!(auth.refresh().await.is_err());
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let out = format!("{:?}", Credential::new("secret", "secret2"));
        assert!(!out.contains("secret"));
    }
}
