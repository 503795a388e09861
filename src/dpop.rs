use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use serde::Serialize;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::AuthError;

fn b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

#[derive(Debug, Clone, Serialize)]
pub struct DPoPCredentials {
    pub x: String,
    pub y: String,
    pub device_uuid: String,
    pub session_id: String,
    pub created_at: f64,
}

/// Holds one EC P-256 keypair and emits fresh DPoP proof JWTs bound to a
/// request's method and URL. The private key never leaves this struct.
pub struct DPoPSigner {
    signing_key: SigningKey,
    credentials: DPoPCredentials,
}

impl std::fmt::Debug for DPoPSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DPoPSigner")
            .field("device_uuid", &self.credentials.device_uuid)
            .field("session_id", &self.credentials.session_id)
            .field("created_at", &self.credentials.created_at)
            .field("signing_key", &"***redacted***")
            .finish()
    }
}

impl DPoPSigner {
    pub fn new() -> Self {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let verifying_key = signing_key.verifying_key();
        let point = verifying_key.to_encoded_point(false);
        let x = point.x().expect("uncompressed point has x");
        let y = point.y().expect("uncompressed point has y");

        let credentials = DPoPCredentials {
            x: b64url(x),
            y: b64url(y),
            device_uuid: Uuid::new_v4().to_string(),
            session_id: Uuid::new_v4().simple().to_string(),
            created_at: now_seconds(),
        };

        Self {
            signing_key,
            credentials,
        }
    }

    pub fn credentials(&self) -> &DPoPCredentials {
        &self.credentials
    }

    pub fn age_seconds(&self) -> f64 {
        now_seconds() - self.credentials.created_at
    }

    /// Emits a compact `header.payload.signature` DPoP JWT bound to `method`
    /// and `url`. Every call produces a distinct `jti`/`iat`.
    pub fn sign(&self, method: &str, url: &str) -> Result<String, AuthError> {
        let header = json!({
            "typ": "dpop+jwt",
            "alg": "ES256",
            "jwk": {
                "kty": "EC",
                "crv": "P-256",
                "x": self.credentials.x,
                "y": self.credentials.y,
            }
        });
        let payload = json!({
            "iat": now_seconds().trunc() as i64,
            "jti": Uuid::new_v4().to_string(),
            "htu": url,
            "htm": method,
            "uuid": self.credentials.device_uuid,
        });

        let header_b64 = b64url(
            &serde_json::to_vec(&header).map_err(|e| AuthError::Signing(e.to_string()))?,
        );
        let payload_b64 = b64url(
            &serde_json::to_vec(&payload).map_err(|e| AuthError::Signing(e.to_string()))?,
        );
        let signing_input = format!("{header_b64}.{payload_b64}");

        let signature: Signature = self.signing_key.sign(signing_input.as_bytes());
        let raw = signature.to_bytes(); // fixed-size r||s, 64 bytes
        let signature_b64 = b64url(&raw);

        Ok(format!("{signing_input}.{signature_b64}"))
    }
}

impl Default for DPoPSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_has_three_parts_with_well_formed_header_and_payload() {
        let signer = DPoPSigner::new();
        let jwt = signer.sign("POST", "https://api.example.jp/v2/entities:search").unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["typ"], "dpop+jwt");
        let x = URL_SAFE_NO_PAD.decode(header["jwk"]["x"].as_str().unwrap()).unwrap();
        let y = URL_SAFE_NO_PAD.decode(header["jwk"]["y"].as_str().unwrap()).unwrap();
        assert_eq!(x.len(), 32);
        assert_eq!(y.len(), 32);

        let payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(payload["htm"], "POST");
        assert_eq!(payload["htu"], "https://api.example.jp/v2/entities:search");
        assert_eq!(payload["uuid"], signer.credentials().device_uuid);

        let signature = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn every_call_has_a_distinct_jti() {
        let signer = DPoPSigner::new();
        let jwt_a = signer.sign("POST", "https://x").unwrap();
        let jwt_b = signer.sign("POST", "https://x").unwrap();
        let payload_of = |jwt: &str| -> serde_json::Value {
            let parts: Vec<&str> = jwt.split('.').collect();
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap()
        };
        assert_ne!(payload_of(&jwt_a)["jti"], payload_of(&jwt_b)["jti"]);
    }
}
