//! # auth
//!
//! Optional bearer-token identity binding. The auth collaborator (account
//! service) issues HS256 tokens; when `AUTH_JWT_SECRET` is configured we
//! validate whatever token a connecting client presents and attach the
//! subject to the connection for log correlation. Telemetry is never
//! gated on it — a vehicle may register under any id it supplies.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    #[allow(dead_code)]
    exp: Option<u64>,
}

pub struct AuthVerifier {
    key: Option<DecodingKey>,
}

impl AuthVerifier {
    /// Build from the deployment's shared secret; `None` disables
    /// validation entirely.
    pub fn new(secret: Option<&str>) -> Self {
        match secret {
            Some(s) if !s.is_empty() => {
                info!("Bearer-token validation enabled");
                Self {
                    key: Some(DecodingKey::from_secret(s.as_bytes())),
                }
            }
            _ => Self { key: None },
        }
    }

    /// Validate a presented token and return its subject. `None` when no
    /// secret is configured, the token is absent, or validation fails —
    /// all of which leave the channel anonymous but open.
    pub fn verify(&self, token: Option<&str>) -> Option<String> {
        let key = self.key.as_ref()?;
        let raw = token?.trim();
        let raw = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
        if raw.is_empty() {
            return None;
        }

        let validation = Validation::new(Algorithm::HS256);
        match decode::<Claims>(raw, key, &validation) {
            Ok(data) => data.claims.sub,
            Err(e) => {
                debug!("Bearer token rejected: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: u64,
    }

    fn token(secret: &str, sub: &str) -> String {
        let exp = (chrono::Utc::now().timestamp() + 3600) as u64;
        encode(
            &Header::default(),
            &TestClaims { sub: sub.into(), exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let v = AuthVerifier::new(Some("s3cret"));
        let t = token("s3cret", "driver-1");
        assert_eq!(v.verify(Some(&t)).as_deref(), Some("driver-1"));
    }

    #[test]
    fn accepts_bearer_prefix() {
        let v = AuthVerifier::new(Some("s3cret"));
        let t = format!("Bearer {}", token("s3cret", "driver-1"));
        assert_eq!(v.verify(Some(&t)).as_deref(), Some("driver-1"));
    }

    #[test]
    fn rejects_wrong_secret_and_missing_token() {
        let v = AuthVerifier::new(Some("s3cret"));
        let t = token("other", "driver-1");
        assert_eq!(v.verify(Some(&t)), None);
        assert_eq!(v.verify(None), None);
    }

    #[test]
    fn disabled_without_secret() {
        let v = AuthVerifier::new(None);
        assert_eq!(v.verify(Some("anything")), None);
    }
}
