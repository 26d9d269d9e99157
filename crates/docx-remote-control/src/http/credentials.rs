use async_trait::async_trait;
use docx_remote_core::{CredentialSource, RemoteError};

/// A fixed bearer token (e.g. from the environment).
///
/// Refreshing cannot produce a new token, so an expired one keeps failing and
/// the retry budget for credentials runs out after one attempt.
#[derive(Clone)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn token(&self, _scopes: &[String]) -> Result<String, RemoteError> {
        if self.token.is_empty() {
            return Err(RemoteError::Configuration(
                "no access token configured".to_string(),
            ));
        }
        Ok(self.token.clone())
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_token_is_configuration_error() {
        let err = StaticCredentials::new("").token(&[]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Configuration(_)));
        assert_eq!(
            StaticCredentials::new("t").token(&[]).await.unwrap(),
            "t"
        );
    }
}
