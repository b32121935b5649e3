//! Issuer account keys
//!
//! Loads the ACME account private key an issuer points at and derives its
//! RFC 7638 JWK thumbprint. RSA and EC (P-256, P-384) keys are supported in
//! PKCS#1, SEC1 and PKCS#8 PEM encodings.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, PrivateKeyInfo};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use super::resources::{IssuerKind, IssuerReference};
use super::store::{IssuerStore, SecretStore};
use super::types::SolverError;

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_P256: &str = "1.2.840.10045.3.1.7";
const OID_P384: &str = "1.3.132.0.34";

/// An issuer's ACME account private key
#[derive(Clone)]
pub enum IssuerKey {
    Rsa(RsaPrivateKey),
    P256(p256::SecretKey),
    P384(p384::SecretKey),
}

impl std::fmt::Debug for IssuerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        write!(f, "IssuerKey({})", self.algorithm())
    }
}

fn decode_err(e: impl std::fmt::Display) -> SolverError {
    SolverError::Decode(e.to_string())
}

impl IssuerKey {
    /// Parse a PEM-encoded private key block
    pub fn from_pem(data: &[u8]) -> Result<Self, SolverError> {
        let block = pem::parse(data)
            .map_err(|e| SolverError::Decode(format!("failed to decode PEM block: {}", e)))?;

        match block.tag() {
            "RSA PRIVATE KEY" => RsaPrivateKey::from_pkcs1_der(block.contents())
                .map(IssuerKey::Rsa)
                .map_err(decode_err),
            "EC PRIVATE KEY" => Self::from_sec1_der(block.contents()),
            "PRIVATE KEY" => Self::from_pkcs8_der(block.contents()),
            other => Err(SolverError::Decode(format!(
                "PEM block '{}' is not a private key",
                other
            ))),
        }
    }

    fn from_sec1_der(der: &[u8]) -> Result<Self, SolverError> {
        let parsed = sec1::EcPrivateKey::try_from(der).map_err(decode_err)?;
        let curve = parsed
            .parameters
            .and_then(|params| params.named_curve())
            .map(|oid| oid.to_string());

        match curve.as_deref() {
            Some(OID_P256) => p256::SecretKey::from_sec1_der(der)
                .map(IssuerKey::P256)
                .map_err(decode_err),
            Some(OID_P384) => p384::SecretKey::from_sec1_der(der)
                .map(IssuerKey::P384)
                .map_err(decode_err),
            Some(other) => Err(SolverError::UnsupportedKeyType(format!("EC curve {}", other))),
            // Curve omitted from the key; infer it from the scalar size
            None => p256::SecretKey::from_sec1_der(der)
                .map(IssuerKey::P256)
                .or_else(|_| p384::SecretKey::from_sec1_der(der).map(IssuerKey::P384))
                .map_err(|_| {
                    SolverError::UnsupportedKeyType("EC key without a known curve".to_string())
                }),
        }
    }

    fn from_pkcs8_der(der: &[u8]) -> Result<Self, SolverError> {
        let info = PrivateKeyInfo::try_from(der).map_err(decode_err)?;
        let algorithm = info.algorithm.oid.to_string();

        match algorithm.as_str() {
            OID_RSA_ENCRYPTION => RsaPrivateKey::from_pkcs8_der(der)
                .map(IssuerKey::Rsa)
                .map_err(decode_err),
            OID_EC_PUBLIC_KEY => {
                let curve = info
                    .algorithm
                    .parameters_oid()
                    .map(|oid| oid.to_string())
                    .map_err(decode_err)?;

                match curve.as_str() {
                    OID_P256 => p256::SecretKey::from_pkcs8_der(der)
                        .map(IssuerKey::P256)
                        .map_err(decode_err),
                    OID_P384 => p384::SecretKey::from_pkcs8_der(der)
                        .map(IssuerKey::P384)
                        .map_err(decode_err),
                    other => Err(SolverError::UnsupportedKeyType(format!("EC curve {}", other))),
                }
            }
            other => Err(SolverError::UnsupportedKeyType(format!("algorithm {}", other))),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            IssuerKey::Rsa(_) => "RSA",
            IssuerKey::P256(_) => "EC P-256",
            IssuerKey::P384(_) => "EC P-384",
        }
    }

    /// Canonical JWK of the public half, members in lexicographic order
    pub fn public_jwk(&self) -> Result<String, SolverError> {
        match self {
            IssuerKey::Rsa(key) => Ok(format!(
                r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
                URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
                URL_SAFE_NO_PAD.encode(key.n().to_bytes_be())
            )),
            IssuerKey::P256(key) => {
                let point = key.public_key().to_encoded_point(false);
                ec_jwk("P-256", point.x().map(|x| x.as_slice()), point.y().map(|y| y.as_slice()))
            }
            IssuerKey::P384(key) => {
                let point = key.public_key().to_encoded_point(false);
                ec_jwk("P-384", point.x().map(|x| x.as_slice()), point.y().map(|y| y.as_slice()))
            }
        }
    }

    /// base64url(SHA-256(JWK)) as used in ACME key authorizations
    pub fn jwk_thumbprint(&self) -> Result<String, SolverError> {
        let jwk = self.public_jwk()?;
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(jwk.as_bytes())))
    }
}

fn ec_jwk(crv: &str, x: Option<&[u8]>, y: Option<&[u8]>) -> Result<String, SolverError> {
    match (x, y) {
        (Some(x), Some(y)) => Ok(format!(
            r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
            crv,
            URL_SAFE_NO_PAD.encode(x),
            URL_SAFE_NO_PAD.encode(y)
        )),
        _ => Err(SolverError::UnsupportedKeyType(format!(
            "{} public key has no affine coordinates",
            crv
        ))),
    }
}

/// Resolves the ACME account key an issuer reference points at
#[derive(Clone)]
pub struct SecretKeyResolver {
    issuers: Arc<dyn IssuerStore>,
    secrets: Arc<dyn SecretStore>,
    cluster_resource_namespace: String,
}

impl SecretKeyResolver {
    /// `cluster_resource_namespace` holds secrets referenced by cluster issuers
    pub fn new(
        issuers: Arc<dyn IssuerStore>,
        secrets: Arc<dyn SecretStore>,
        cluster_resource_namespace: impl Into<String>,
    ) -> Self {
        Self {
            issuers,
            secrets,
            cluster_resource_namespace: cluster_resource_namespace.into(),
        }
    }

    pub async fn resolve(
        &self,
        issuer_ref: &IssuerReference,
        namespace: &str,
    ) -> Result<IssuerKey, SolverError> {
        let (acme, secret_namespace) = match issuer_ref.issuer_kind()? {
            IssuerKind::ClusterIssuer => (
                self.issuers.get_cluster_issuer(&issuer_ref.name).await?,
                self.cluster_resource_namespace.as_str(),
            ),
            IssuerKind::Issuer => (
                self.issuers.get_issuer(namespace, &issuer_ref.name).await?,
                namespace,
            ),
        };

        let selector = &acme.private_key_secret_ref;
        let secret_namespace = selector
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(secret_namespace);

        debug!(
            issuer = %issuer_ref.name,
            kind = ?issuer_ref.issuer_kind(),
            secret = %selector.name,
            namespace = %secret_namespace,
            "Resolving issuer private key"
        );

        let data = self.secrets.get_secret(secret_namespace, &selector.name).await?;
        let key_name = selector.data_key();

        match data.get(key_name) {
            Some(bytes) if !bytes.is_empty() => IssuerKey::from_pem(bytes),
            _ => Err(SolverError::NotFound(format!(
                "private key '{}' in secret {}/{}",
                key_name, secret_namespace, selector.name
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    use rand::rngs::OsRng;
    use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
    use rsa::RsaPrivateKey;

    pub fn rsa_pem() -> String {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        key.to_pkcs1_pem(LineEnding::LF).unwrap().to_string()
    }

    pub fn p256_pem() -> String {
        let key = p256::SecretKey::random(&mut OsRng);
        key.to_sec1_pem(LineEnding::LF).unwrap().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::resources::{AcmeIssuer, SecretKeySelector};
    use crate::solver::store::memory::MemoryStore;
    use rand::rngs::OsRng;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    fn acme(name: &str, key: Option<&str>) -> AcmeIssuer {
        AcmeIssuer {
            private_key_secret_ref: SecretKeySelector {
                name: name.to_string(),
                key: key.map(str::to_string),
                namespace: None,
            },
        }
    }

    fn resolver(store: Arc<MemoryStore>) -> SecretKeyResolver {
        SecretKeyResolver::new(store.clone(), store, "cert-manager")
    }

    #[test]
    fn test_rsa_jwk_shape() {
        let key = IssuerKey::from_pem(test_keys::rsa_pem().as_bytes()).unwrap();
        assert_eq!(key.algorithm(), "RSA");

        let jwk = key.public_jwk().unwrap();
        assert!(jwk.starts_with(r#"{"e":"AQAB","kty":"RSA","n":""#));
        assert!(!jwk.contains(' '));

        let thumbprint = key.jwk_thumbprint().unwrap();
        assert_eq!(thumbprint.len(), 43);
        assert_eq!(
            thumbprint,
            URL_SAFE_NO_PAD.encode(Sha256::digest(jwk.as_bytes()))
        );
    }

    #[test]
    fn test_ec_jwk_fixed_width_coordinates() {
        let key = IssuerKey::from_pem(test_keys::p256_pem().as_bytes()).unwrap();
        assert_eq!(key.algorithm(), "EC P-256");

        let jwk: serde_json::Value = serde_json::from_str(&key.public_jwk().unwrap()).unwrap();
        assert_eq!(jwk["crv"], "P-256");
        assert_eq!(jwk["kty"], "EC");
        let x = URL_SAFE_NO_PAD.decode(jwk["x"].as_str().unwrap()).unwrap();
        let y = URL_SAFE_NO_PAD.decode(jwk["y"].as_str().unwrap()).unwrap();
        assert_eq!(x.len(), 32);
        assert_eq!(y.len(), 32);
    }

    #[test]
    fn test_pkcs8_keys() {
        let ec = p384::SecretKey::random(&mut OsRng);
        let pem = ec.to_pkcs8_pem(LineEnding::LF).unwrap();
        let key = IssuerKey::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(key.algorithm(), "EC P-384");

        let rsa = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = rsa.to_pkcs8_pem(LineEnding::LF).unwrap();
        let key = IssuerKey::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(key.algorithm(), "RSA");
    }

    #[test]
    fn test_thumbprint_is_stable() {
        let pem = test_keys::p256_pem();
        let a = IssuerKey::from_pem(pem.as_bytes()).unwrap();
        let b = IssuerKey::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(a.jwk_thumbprint().unwrap(), b.jwk_thumbprint().unwrap());

        let other = IssuerKey::from_pem(test_keys::p256_pem().as_bytes()).unwrap();
        assert_ne!(a.jwk_thumbprint().unwrap(), other.jwk_thumbprint().unwrap());
    }

    #[test]
    fn test_ed25519_is_unsupported() {
        // PKCS#8 Ed25519 key (RFC 8410 layout)
        let mut der = vec![
            0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22,
            0x04, 0x20,
        ];
        der.extend_from_slice(&[7u8; 32]);
        let pem = pem::encode(&pem::Pem::new("PRIVATE KEY", der));

        let err = IssuerKey::from_pem(pem.as_bytes()).unwrap_err();
        assert!(matches!(err, SolverError::UnsupportedKeyType(_)), "{:?}", err);
    }

    #[test]
    fn test_decode_errors() {
        let err = IssuerKey::from_pem(b"not a pem").unwrap_err();
        assert!(matches!(err, SolverError::Decode(_)));

        let cert = pem::encode(&pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        let err = IssuerKey::from_pem(cert.as_bytes()).unwrap_err();
        assert!(matches!(err, SolverError::Decode(_)));

        let garbage = pem::encode(&pem::Pem::new("RSA PRIVATE KEY", vec![1, 2, 3]));
        let err = IssuerKey::from_pem(garbage.as_bytes()).unwrap_err();
        assert!(matches!(err, SolverError::Decode(_)));
    }

    #[tokio::test]
    async fn test_resolve_namespaced_issuer() {
        let store = Arc::new(MemoryStore::default());
        let pem = test_keys::rsa_pem();
        store.insert_issuer("team-a", "le", acme("le-account", None));
        store.insert_secret("team-a", "le-account", &[("tls.key", pem.as_bytes())]);

        let issuer_ref = IssuerReference {
            name: "le".to_string(),
            kind: "Issuer".to_string(),
            group: "cert-manager.io".to_string(),
        };

        let key = resolver(store).resolve(&issuer_ref, "team-a").await.unwrap();
        assert_eq!(key.algorithm(), "RSA");
    }

    #[tokio::test]
    async fn test_resolve_cluster_issuer_uses_cluster_namespace() {
        let store = Arc::new(MemoryStore::default());
        let pem = test_keys::p256_pem();
        store.insert_cluster_issuer("le-prod", acme("le-prod-account", Some("account.key")));
        store.insert_secret("cert-manager", "le-prod-account", &[("account.key", pem.as_bytes())]);
        // Same secret name in the caller namespace must be ignored
        store.insert_secret("team-a", "le-prod-account", &[("account.key", b"bogus")]);

        let issuer_ref = IssuerReference {
            name: "le-prod".to_string(),
            kind: "ClusterIssuer".to_string(),
            group: String::new(),
        };

        let key = resolver(store).resolve(&issuer_ref, "team-a").await.unwrap();
        assert_eq!(key.algorithm(), "EC P-256");
    }

    #[tokio::test]
    async fn test_resolve_selector_namespace_override() {
        let store = Arc::new(MemoryStore::default());
        let pem = test_keys::p256_pem();
        let mut issuer = acme("shared-account", None);
        issuer.private_key_secret_ref.namespace = Some("shared".to_string());
        store.insert_cluster_issuer("le-shared", issuer);
        store.insert_secret("shared", "shared-account", &[("tls.key", pem.as_bytes())]);

        let issuer_ref = IssuerReference {
            name: "le-shared".to_string(),
            kind: "ClusterIssuer".to_string(),
            group: String::new(),
        };

        let key = resolver(store).resolve(&issuer_ref, "team-a").await.unwrap();
        assert_eq!(key.algorithm(), "EC P-256");
    }

    #[tokio::test]
    async fn test_resolve_missing_pieces() {
        let store = Arc::new(MemoryStore::default());
        let issuer_ref = IssuerReference {
            name: "le".to_string(),
            ..Default::default()
        };

        let err = resolver(store.clone()).resolve(&issuer_ref, "ns").await.unwrap_err();
        assert!(matches!(err, SolverError::NotFound(_)));

        store.insert_issuer("ns", "le", acme("le-account", None));
        let err = resolver(store.clone()).resolve(&issuer_ref, "ns").await.unwrap_err();
        assert!(matches!(err, SolverError::NotFound(_)));

        store.insert_secret("ns", "le-account", &[("other.key", b"x")]);
        let err = resolver(store.clone()).resolve(&issuer_ref, "ns").await.unwrap_err();
        assert!(matches!(err, SolverError::NotFound(_)));

        store.insert_secret("ns", "le-account", &[("tls.key", b"")]);
        let err = resolver(store).resolve(&issuer_ref, "ns").await.unwrap_err();
        assert!(matches!(err, SolverError::NotFound(_)));
    }
}
