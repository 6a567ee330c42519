use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Claims carried by tenant tokens. The issuer is the `app_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub exp: i64,
}

/// Extract the raw token from an `Authorization` header value.
pub fn bearer_token(header_value: &str) -> &str {
    header_value
        .strip_prefix("Bearer ")
        .unwrap_or(header_value)
        .trim()
}

/// Read the issuer out of the (unverified) claims segment. The signature
/// is checked afterwards against the secret of the app this issuer names.
pub fn peek_issuer(token: &str) -> Result<String, GatewayError> {
    let claims_segment = token
        .split('.')
        .nth(1)
        .ok_or_else(|| GatewayError::AuthFailed("malformed jwt".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(claims_segment)
        .map_err(|_| GatewayError::AuthFailed("malformed jwt claims".into()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|_| GatewayError::AuthFailed("malformed jwt claims".into()))?;
    value
        .get("iss")
        .and_then(|iss| iss.as_str())
        .map(str::to_owned)
        .ok_or_else(|| GatewayError::AuthFailed("jwt has no issuer".into()))
}

/// Verify signature and expiry with the app secret (HS256).
pub fn verify(token: &str, secret: &str) -> Result<Claims, GatewayError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256))
        .map(|data| data.claims)
        .map_err(|err| GatewayError::AuthFailed(format!("jwt decode: {}", err)))
}

/// Mint a tenant token; the control plane's token endpoint uses this.
pub fn issue(app_id: &str, secret: &str, ttl_secs: i64) -> Result<String, GatewayError> {
    let claims = Claims {
        iss: app_id.to_owned(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| GatewayError::AuthFailed(format!("jwt encode: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_prefix_is_optional() {
        assert_eq!(bearer_token("Bearer abc.def.ghi"), "abc.def.ghi");
        assert_eq!(bearer_token("abc.def.ghi"), "abc.def.ghi");
    }

    #[test]
    fn issue_peek_verify_round_trip() {
        let token = issue("app_id_a", "secret_a", 3600).unwrap();
        assert_eq!(peek_issuer(&token).unwrap(), "app_id_a");
        let claims = verify(&token, "secret_a").unwrap();
        assert_eq!(claims.iss, "app_id_a");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue("app_id_a", "secret_a", 3600).unwrap();
        assert!(matches!(
            verify(&token, "other"),
            Err(GatewayError::AuthFailed(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = issue("app_id_a", "secret_a", -3600).unwrap();
        assert!(verify(&token, "secret_a").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(peek_issuer("nonsense").is_err());
        assert!(verify("nonsense", "secret").is_err());
    }
}
