//! Authentication plugin support.
//!
//! Covers the scramble plugins (`mysql_native_password`,
//! `caching_sha2_password` fast path), the RSA public-key password exchange
//! shared by `sha256_password` and the caching SHA-2 full path, and the
//! GSSAPI hook that delegates to an injected credential provider.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
pub const SHA256_PASSWORD_PLUGIN: &str = "sha256_password";
pub const CACHING_SHA2_PASSWORD_PLUGIN: &str = "caching_sha2_password";
pub const GSSAPI_PLUGIN: &str = "auth_gssapi_client";

/// Fast auth success indicator for caching_sha2_password: the server had the
/// hash cached and the scramble was enough
pub const CACHING_SHA2_FAST_AUTH_SUCCESS: u8 = 0x03;

/// Full auth required indicator: the server needs the cleartext password,
/// over TLS or RSA-encrypted
pub const CACHING_SHA2_FULL_AUTH_REQUIRED: u8 = 0x04;

/// Request byte asking the server for its RSA public key
pub const REQUEST_PUBLIC_KEY: u8 = 0x02;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unknown authentication plugin: {0}")]
    UnknownPlugin(String),

    #[error("Server public key unavailable: {0}")]
    PublicKey(String),

    #[error("RSA password encryption failed: {0}")]
    Rsa(String),

    #[error("Unsupported password encoding: {0}")]
    PasswordEncoding(String),

    #[error("No credential provider bound for {0}")]
    NoCredentialProvider(String),

    #[error("Credential provider error: {0}")]
    Provider(String),
}

/// Authentication plugin negotiated with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    Sha256Password,
    CachingSha2Password,
    Gssapi,
}

impl AuthPlugin {
    pub fn from_name(name: &str) -> Result<Self, AuthError> {
        match name {
            NATIVE_PASSWORD_PLUGIN | "" => Ok(AuthPlugin::NativePassword),
            SHA256_PASSWORD_PLUGIN => Ok(AuthPlugin::Sha256Password),
            CACHING_SHA2_PASSWORD_PLUGIN => Ok(AuthPlugin::CachingSha2Password),
            GSSAPI_PLUGIN => Ok(AuthPlugin::Gssapi),
            other => Err(AuthError::UnknownPlugin(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => NATIVE_PASSWORD_PLUGIN,
            AuthPlugin::Sha256Password => SHA256_PASSWORD_PLUGIN,
            AuthPlugin::CachingSha2Password => CACHING_SHA2_PASSWORD_PLUGIN,
            AuthPlugin::Gssapi => GSSAPI_PLUGIN,
        }
    }

    /// Initial scramble-based response for the handshake packet
    pub fn scramble(&self, password: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AuthError> {
        match self {
            AuthPlugin::NativePassword => Ok(scramble_native(password, nonce)),
            AuthPlugin::CachingSha2Password => Ok(scramble_sha256(password, nonce)),
            // sha256_password over plaintext starts with an empty response
            // and proceeds via public-key exchange
            AuthPlugin::Sha256Password => Ok(Vec::new()),
            AuthPlugin::Gssapi => Ok(Vec::new()),
        }
    }
}

/// Compute mysql_native_password auth response:
/// SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))
pub fn scramble_native(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password);
    let hash1 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Compute the caching_sha2_password fast-path scramble:
/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)
pub fn scramble_sha256(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha256::new();
    hasher.update(password);
    let hash1 = hasher.finalize();

    let mut hasher = Sha256::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(nonce);
    let hash3 = hasher.finalize();

    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// XOR the null-terminated password with the nonce (repeated), then encrypt
/// with the server's RSA key. Used by sha256_password and the
/// caching_sha2_password full path over plaintext connections; the two
/// plugins use different RSA paddings.
pub fn encrypt_password(
    password: &[u8],
    nonce: &[u8],
    public_key_pem: &str,
    plugin: AuthPlugin,
) -> Result<Vec<u8>, AuthError> {
    let key = parse_public_key(public_key_pem)?;

    let mut obfuscated = Vec::with_capacity(password.len() + 1);
    obfuscated.extend_from_slice(password);
    obfuscated.push(0);
    for (idx, byte) in obfuscated.iter_mut().enumerate() {
        *byte ^= nonce[idx % nonce.len()];
    }

    let mut rng = rand::thread_rng();
    match plugin {
        // caching_sha2_password servers expect OAEP
        AuthPlugin::CachingSha2Password => key
            .encrypt(&mut rng, Oaep::new::<Sha1>(), &obfuscated)
            .map_err(|e| AuthError::Rsa(e.to_string())),
        // sha256_password keeps the legacy PKCS#1 v1.5 padding
        _ => key
            .encrypt(&mut rng, Pkcs1v15Encrypt, &obfuscated)
            .map_err(|e| AuthError::Rsa(e.to_string())),
    }
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, AuthError> {
    // Servers hand out SPKI ("BEGIN PUBLIC KEY"); key files may be PKCS#1
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AuthError::PublicKey(e.to_string()))
}

/// Encode the password per the configured character encoding before any
/// scramble or encryption sees it.
pub fn encode_password(password: &str, encoding: &str) -> Result<Vec<u8>, AuthError> {
    match encoding.to_ascii_lowercase().as_str() {
        "" | "utf8" | "utf-8" | "utf8mb4" => Ok(password.as_bytes().to_vec()),
        "latin1" | "iso-8859-1" => {
            let mut out = Vec::with_capacity(password.len());
            for ch in password.chars() {
                let code = ch as u32;
                if code > 0xFF {
                    return Err(AuthError::PasswordEncoding(format!(
                        "character U+{:04X} not representable in latin1",
                        code
                    )));
                }
                out.push(code as u8);
            }
            Ok(out)
        }
        other => Err(AuthError::PasswordEncoding(other.to_string())),
    }
}

/// Externally supplied credentials. Replaces any process-global lookup: the
/// provider is a value handed to the connector.
pub trait CredentialProvider: Send + Sync + std::fmt::Debug {
    /// User and password to authenticate with. A `None` password means
    /// password-less auth (e.g. GSSAPI).
    fn credentials(&self) -> Result<(String, Option<String>), AuthError>;

    /// Produce a GSSAPI token for the given service principal. Only
    /// meaningful on platforms with a bound native credential source.
    fn gssapi_token(&self, principal: &str) -> Result<Vec<u8>, AuthError> {
        Err(AuthError::NoCredentialProvider(format!(
            "GSSAPI principal {principal}"
        )))
    }
}

/// Plain user/password credentials from the connection URL
#[derive(Debug, Clone)]
pub struct PasswordCredentials {
    pub user: String,
    pub password: Option<String>,
}

impl CredentialProvider for PasswordCredentials {
    fn credentials(&self) -> Result<(String, Option<String>), AuthError> {
        Ok((self.user.clone(), self.password.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONCE: [u8; 20] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
    ];

    #[test]
    fn native_scramble_is_20_bytes() {
        let scramble = scramble_native(b"secret", &NONCE);
        assert_eq!(scramble.len(), 20);
        // Deterministic for the same inputs
        assert_eq!(scramble, scramble_native(b"secret", &NONCE));
        assert_ne!(scramble, scramble_native(b"other", &NONCE));
    }

    #[test]
    fn sha256_scramble_is_32_bytes() {
        let scramble = scramble_sha256(b"secret", &NONCE);
        assert_eq!(scramble.len(), 32);
        assert_ne!(scramble, scramble_sha256(b"secret", &NONCE[..19].to_vec()));
    }

    #[test]
    fn empty_password_scrambles_to_empty() {
        assert!(scramble_native(b"", &NONCE).is_empty());
        assert!(scramble_sha256(b"", &NONCE).is_empty());
    }

    #[test]
    fn plugin_names_roundtrip() {
        for plugin in [
            AuthPlugin::NativePassword,
            AuthPlugin::Sha256Password,
            AuthPlugin::CachingSha2Password,
            AuthPlugin::Gssapi,
        ] {
            assert_eq!(AuthPlugin::from_name(plugin.name()).unwrap(), plugin);
        }
        assert!(AuthPlugin::from_name("mysql_clear_password").is_err());
        // Empty plugin name defaults to native
        assert_eq!(
            AuthPlugin::from_name("").unwrap(),
            AuthPlugin::NativePassword
        );
    }

    #[test]
    fn latin1_password_encoding() {
        assert_eq!(encode_password("café", "latin1").unwrap(), b"caf\xe9");
        assert!(encode_password("日本語", "latin1").is_err());
        assert_eq!(encode_password("abc", "utf8").unwrap(), b"abc");
        assert!(encode_password("abc", "utf-16").is_err());
    }

    #[test]
    fn password_provider_returns_configured_pair() {
        let provider = PasswordCredentials {
            user: "app".to_string(),
            password: Some("pw".to_string()),
        };
        let (user, password) = provider.credentials().unwrap();
        assert_eq!(user, "app");
        assert_eq!(password.as_deref(), Some("pw"));
        // Default GSSAPI hook refuses without a native binding
        assert!(provider.gssapi_token("mariadb/host").is_err());
    }

    #[test]
    fn bad_public_key_is_reported() {
        let err = encrypt_password(b"pw", &NONCE, "not a pem", AuthPlugin::Sha256Password)
            .unwrap_err();
        assert!(matches!(err, AuthError::PublicKey(_)));
    }
}
