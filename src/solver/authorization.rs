//! Key authorization verification
//!
//! A DNS-01 record value is `base64url(SHA-256(token "." thumbprint))`. The
//! solver recomputes it from the mirrored challenge and the issuer key and
//! refuses to touch DNS unless it matches the digest cert-manager sent.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use super::keys::IssuerKey;
use super::resources::Challenge;
use super::types::SolverError;

/// A verified key authorization and the token it was derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAuthorization {
    pub key_authorization: String,
    pub token: String,
}

/// `token "." thumbprint`
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

/// DNS-01 record value for a key authorization
pub fn challenge_digest(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Recompute the key authorization for `challenge` and check it against the
/// digest carried by the request
pub fn compute_and_verify(
    challenge: &Challenge,
    key: &IssuerKey,
    request_digest: &str,
) -> Result<KeyAuthorization, SolverError> {
    let thumbprint = key.jwk_thumbprint()?;
    verify_with_thumbprint(
        &challenge.spec.dns_name,
        &challenge.spec.token,
        &thumbprint,
        request_digest,
    )
}

pub(crate) fn verify_with_thumbprint(
    dns_name: &str,
    token: &str,
    thumbprint: &str,
    request_digest: &str,
) -> Result<KeyAuthorization, SolverError> {
    let key_authorization = key_authorization(token, thumbprint);

    if challenge_digest(&key_authorization) != request_digest {
        return Err(SolverError::AuthorizationMismatch {
            dns_name: dns_name.to_string(),
        });
    }

    Ok(KeyAuthorization {
        key_authorization,
        token: token.to_string(),
    })
}
