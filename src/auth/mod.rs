use crate::config::{AuthConfig, SecurityMode};
use crate::error::{Error, ErrorKind};

pub mod sigv4;

pub use sigv4::Credentials;

/// Resolve AWS-style credentials from the environment variables named by the
/// auth config. Under `strict` security a missing variable fails the auth
/// attempt; under `permissive` the request proceeds unsigned (`Ok(None)`).
pub fn resolve_credentials(
    auth: &AuthConfig,
    security: &SecurityMode,
) -> Result<Option<Credentials>, Error> {
    let (access_var, secret_var, session_var) = match auth {
        AuthConfig::AwsS3 {
            access_key_var,
            secret_key_var,
            session_token_var,
            ..
        }
        | AuthConfig::AwsS3PresignedUrl {
            access_key_var,
            secret_key_var,
            session_token_var,
            ..
        } => (access_key_var, secret_key_var, session_token_var),
        _ => return Ok(None),
    };

    let access_key = std::env::var(access_var).ok();
    let secret_key = std::env::var(secret_var).ok();

    match (access_key, secret_key) {
        (Some(access_key), Some(secret_key)) => {
            let session_token = session_var
                .as_ref()
                .and_then(|var| std::env::var(var).ok());
            Ok(Some(Credentials::new(
                access_key,
                secret_key,
                session_token,
            )))
        }
        _ => match security {
            SecurityMode::Strict => Err(Error::new(ErrorKind::MissingCredentials(format!(
                "{} / {}",
                access_var, secret_var
            )))),
            SecurityMode::Permissive => Ok(None),
        },
    }
}

/// Headers to attach for `bearer` and `header` auth configs.
pub fn static_auth_headers(
    auth: &AuthConfig,
    security: &SecurityMode,
) -> Result<Vec<(String, String)>, Error> {
    match auth {
        AuthConfig::Bearer { token_var } => match std::env::var(token_var) {
            Ok(token) => Ok(vec![(
                "authorization".to_string(),
                format!("Bearer {}", token),
            )]),
            Err(_) => match security {
                SecurityMode::Strict => Err(Error::new(ErrorKind::MissingCredentials(
                    token_var.clone(),
                ))),
                SecurityMode::Permissive => Ok(Vec::new()),
            },
        },
        AuthConfig::Header { headers } => Ok(headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect()),
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presign_auth(access: &str, secret: &str) -> AuthConfig {
        AuthConfig::AwsS3PresignedUrl {
            access_key_var: access.into(),
            secret_key_var: secret.into(),
            session_token_var: None,
            region: "us-east-1".into(),
            service: "s3".into(),
            expires_in_secs: None,
        }
    }

    #[test]
    fn strict_mode_requires_credentials() {
        let auth = presign_auth("VTP_TEST_MISSING_AK", "VTP_TEST_MISSING_SK");

        let err = resolve_credentials(&auth, &SecurityMode::Strict).unwrap_err();
        assert_eq!(err.kind_tag(), "MissingCredentials");

        let none = resolve_credentials(&auth, &SecurityMode::Permissive).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn env_vars_supply_credentials() {
        std::env::set_var("VTP_TEST_AK", "AKIDEXAMPLE");
        std::env::set_var("VTP_TEST_SK", "secret");

        let auth = presign_auth("VTP_TEST_AK", "VTP_TEST_SK");
        let creds = resolve_credentials(&auth, &SecurityMode::Strict)
            .unwrap()
            .unwrap();
        assert_eq!(creds.access_key(), "AKIDEXAMPLE");

        std::env::remove_var("VTP_TEST_AK");
        std::env::remove_var("VTP_TEST_SK");
    }

    #[test]
    fn header_auth_lowercases_names() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("X-Custom-Token".to_string(), "abc".to_string());
        let auth = AuthConfig::Header { headers };

        let resolved = static_auth_headers(&auth, &SecurityMode::Strict).unwrap();
        assert_eq!(resolved, vec![("x-custom-token".to_string(), "abc".to_string())]);
    }
}
