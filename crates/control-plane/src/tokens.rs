use rand::Rng;

use crate::Result;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use sha2::{Digest, Sha256};

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of host bearer tokens and subscription tokens.
pub const TOKEN_LEN: usize = 48;

/// Random alphanumeric string of `len` characters.
pub fn random_alphanumeric(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Generate a random bearer token.
pub fn generate_token() -> String {
    random_alphanumeric(TOKEN_LEN)
}

/// Hash a token using argon2id and a pepper.
pub fn hash_token(token: &str, pepper: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let password = format!("{token}{pepper}");
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("failed to hash token: {}", err))?
        .to_string())
}

/// True when the token matches the stored argon2 hash.
pub fn verify_token(token: &str, stored_hash: &str, pepper: &str) -> bool {
    let password = format!("{token}{pepper}");
    let Ok(password_hash) = PasswordHash::new(stored_hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &password_hash)
        .is_ok()
}

/// Short, stable stand-in for a secret value in audit records.
pub fn redact(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("redacted:{}", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_alphanumeric() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn hash_round_trip_requires_matching_pepper() {
        let hash = hash_token("host-token", "pepper").unwrap();
        assert!(verify_token("host-token", &hash, "pepper"));
        assert!(!verify_token("host-token", &hash, "other"));
        assert!(!verify_token("wrong", &hash, "pepper"));
        assert!(!verify_token("host-token", "not-a-phc-string", "pepper"));
    }

    #[test]
    fn redaction_is_stable_and_hides_input() {
        let first = redact("private-key-material");
        assert_eq!(first, redact("private-key-material"));
        assert!(first.starts_with("redacted:"));
        assert!(!first.contains("private"));
        assert_ne!(first, redact("other"));
    }
}
