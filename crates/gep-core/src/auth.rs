//! Gateway-mode authentication tokens.
//!
//! A token is `[salt: 8][auth key]`, the auth key in the session's text
//! encoding, sealed with the connection's [`SharedSecret`]. The salt makes two
//! tokens for the same key differ on the wire.
//!
//! # Security
//!
//! - Verification compares the decoded key bytes in constant time.
//! - Failures never reveal which step failed to the peer; the reason is only
//!   logged locally.

use bytes::Bytes;
use gep_proto::{TextEncoding, payloads::AuthenticateRequest};
use subtle::ConstantTimeEq;

use crate::{cipher::SharedSecret, env::Environment, error::SessionError};

const SALT_SIZE: usize = 8;

/// Seal `auth_key` into an `Authenticate` token.
///
/// # Errors
///
/// Returns an error if the key cannot be represented in `encoding`, sealing
/// fails, or the sealed token falls outside the permitted token length.
pub fn build_auth_token(
    env: &impl Environment,
    secret: &SharedSecret,
    auth_key: &str,
    encoding: TextEncoding,
) -> Result<Bytes, SessionError> {
    let mut plaintext = vec![0u8; SALT_SIZE];
    env.random_bytes(&mut plaintext);
    plaintext.extend_from_slice(&encoding.encode(auth_key)?);

    let token = secret.seal(env, &plaintext)?;
    if !(AuthenticateRequest::MIN_TOKEN..=AuthenticateRequest::MAX_TOKEN).contains(&token.len()) {
        return Err(SessionError::Rejected { reason: "Authentication key too long".to_string() });
    }
    Ok(token.into())
}

/// Check a token against the expected auth key.
///
/// # Errors
///
/// Returns [`SessionError::AuthenticationFailed`] if the token does not open
/// or carries a different key.
pub fn verify_auth_token(
    secret: &SharedSecret,
    token: &[u8],
    expected_key: &str,
    encoding: TextEncoding,
) -> Result<(), SessionError> {
    let plaintext = secret
        .open(token)
        .map_err(|_| SessionError::AuthenticationFailed { reason: "token did not decrypt" })?;
    if plaintext.len() < SALT_SIZE {
        return Err(SessionError::AuthenticationFailed { reason: "token too short" });
    }

    let expected = encoding.encode(expected_key)?;
    if bool::from(plaintext[SALT_SIZE..].ct_eq(&expected)) {
        Ok(())
    } else {
        Err(SessionError::AuthenticationFailed { reason: "auth key mismatch" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::testing::TestEnv;

    #[test]
    fn token_verifies_under_same_secret_and_encoding() {
        let env = TestEnv::new();
        let secret = SharedSecret::derive("s3cret").unwrap();
        let token = build_auth_token(&env, &secret, "substation-7", TextEncoding::Utf8).unwrap();

        assert!(verify_auth_token(&secret, &token, "substation-7", TextEncoding::Utf8).is_ok());
        assert_eq!(
            verify_auth_token(&secret, &token, "substation-8", TextEncoding::Utf8),
            Err(SessionError::AuthenticationFailed { reason: "auth key mismatch" })
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let env = TestEnv::new();
        let secret = SharedSecret::derive("s3cret").unwrap();
        let token = build_auth_token(&env, &secret, "key", TextEncoding::Utf16Le).unwrap();

        let other = SharedSecret::derive("other").unwrap();
        assert_eq!(
            verify_auth_token(&other, &token, "key", TextEncoding::Utf16Le),
            Err(SessionError::AuthenticationFailed { reason: "token did not decrypt" })
        );
    }

    #[test]
    fn salt_makes_tokens_unique() {
        let env = TestEnv::new();
        let secret = SharedSecret::derive("s3cret").unwrap();
        let a = build_auth_token(&env, &secret, "key", TextEncoding::Utf8).unwrap();
        let b = build_auth_token(&env, &secret, "key", TextEncoding::Utf8).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn oversized_key_is_refused() {
        let env = TestEnv::new();
        let secret = SharedSecret::derive("s3cret").unwrap();
        let long = "k".repeat(300);
        assert!(build_auth_token(&env, &secret, &long, TextEncoding::Utf8).is_err());
    }
}
