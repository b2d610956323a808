use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::SigningKey;
use serde_json::Value;

use common::api::Settings;

/// X25519 key pair encoded the way Reality clients and servers expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Fresh key pair from OS randomness.
pub fn generate_keypair() -> RealityKeyPair {
    let seed: [u8; 32] = rand::random();
    keypair_from_seed(&seed)
}

/// Derives the X25519 pair from an Ed25519 seed: the expanded scalar is the private half and
/// the Montgomery form of the verifying key is the public half.
pub fn keypair_from_seed(seed: &[u8; 32]) -> RealityKeyPair {
    let signing = SigningKey::from_bytes(seed);
    let private = signing.to_scalar_bytes();
    let public = signing.verifying_key().to_montgomery().to_bytes();
    RealityKeyPair {
        private_key: URL_SAFE_NO_PAD.encode(private),
        public_key: URL_SAFE_NO_PAD.encode(public),
    }
}

fn has_value(params: &Settings, key: &str) -> bool {
    matches!(params.get(key), Some(Value::String(s)) if !s.trim().is_empty())
}

/// Fills `private_key`, `reality_private_key` and `public_key` unless the params already carry a
/// complete pair. Returns true when a pair was generated.
pub fn provision(params: &mut Settings) -> bool {
    let has_private = has_value(params, "private_key") || has_value(params, "reality_private_key");
    if has_private && has_value(params, "public_key") {
        return false;
    }

    let pair = generate_keypair();
    params.insert("private_key".into(), Value::String(pair.private_key.clone()));
    params.insert("reality_private_key".into(), Value::String(pair.private_key));
    params.insert("public_key".into(), Value::String(pair.public_key));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_32_bytes_base64url() {
        let pair = generate_keypair();
        for key in [&pair.private_key, &pair.public_key] {
            assert_eq!(key.len(), 43);
            assert!(!key.contains('='));
            assert_eq!(URL_SAFE_NO_PAD.decode(key).unwrap().len(), 32);
        }
        assert_ne!(pair, generate_keypair());
    }

    #[test]
    fn seed_derivation_is_deterministic() {
        let seed = [7u8; 32];
        assert_eq!(keypair_from_seed(&seed), keypair_from_seed(&seed));
        assert_ne!(keypair_from_seed(&seed), keypair_from_seed(&[8u8; 32]));
    }

    #[test]
    fn provision_keeps_a_complete_pair() {
        let mut params = json!({"private_key": "p", "public_key": "q"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(!provision(&mut params));
        assert_eq!(params["private_key"], "p");
    }

    #[test]
    fn provision_replaces_a_half_pair() {
        let mut params = json!({"public_key": "orphan"}).as_object().cloned().unwrap();
        assert!(provision(&mut params));
        assert_ne!(params["public_key"], "orphan");
        assert_eq!(params["private_key"], params["reality_private_key"]);
    }
}
