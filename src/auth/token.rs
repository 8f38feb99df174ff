//! Short-lived hop tokens.
//!
//! Tokens are asymmetric JWTs signed with the configured private key. The
//! verifying half is derived from that same key, so a manager only accepts
//! tokens that it, or a peer configured with the identical key, issued.

use crate::consts;
use chrono::{DateTime, TimeDelta, Utc};
use derive_more::{Display, Error};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
    errors::ErrorKind,
};
use openssl::{
    nid::Nid,
    pkey::{Id, PKey},
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Display, Error)]
pub enum TokenError {
    #[display("signing key is empty")]
    EmptyKey,
    #[display("invalid signing key: {_0}")]
    InvalidKey(#[error(not(source))] String),
    #[display("unsupported signing algorithm: {_0}")]
    UnsupportedAlgorithm(#[error(not(source))] String),
    #[display("malformed token: {_0}")]
    Malformed(#[error(not(source))] String),
    #[display("token could not be signed: {_0}")]
    Signing(#[error(not(source))] String),
}

/// Algorithms a manager can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SigningAlgorithm {
    #[display("ES256")]
    Es256,
    #[display("RS256")]
    Rs256,
}

impl FromStr for SigningAlgorithm {
    type Err = TokenError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "ES256" => Ok(Self::Es256),
            "RS256" => Ok(Self::Rs256),
            other => Err(TokenError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl From<SigningAlgorithm> for Algorithm {
    fn from(value: SigningAlgorithm) -> Self {
        match value {
            SigningAlgorithm::Es256 => Algorithm::ES256,
            SigningAlgorithm::Rs256 => Algorithm::RS256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Outcome of checking a structurally sound token
#[derive(Debug, Clone)]
pub struct TokenVerification {
    pub valid: bool,
    pub header: Option<Header>,
    pub claims: Option<TokenClaims>,
}

impl TokenVerification {
    /// Subject of a valid token, `None` when the token was rejected
    pub fn subject(&self) -> Option<&str> {
        if !self.valid {
            return None;
        }
        self.claims.as_ref().map(|claims| claims.sub.as_str())
    }
}

pub struct TokenManager {
    algorithm: SigningAlgorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenManager {
    /// Builds a manager from a PEM private key (PKCS#8, SEC1 or PKCS#1).
    pub fn new(algorithm: &str, private_key_pem: &str) -> Result<Self, TokenError> {
        if private_key_pem.trim().is_empty() {
            return Err(TokenError::EmptyKey);
        }

        let algorithm = SigningAlgorithm::from_str(algorithm)?;
        let pkey = PKey::private_key_from_pem(private_key_pem.as_bytes())
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let public_pem = pkey
            .public_key_to_pem()
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;

        let (encoding_key, decoding_key) = match algorithm {
            SigningAlgorithm::Es256 => {
                let ec_key = pkey
                    .ec_key()
                    .map_err(|_| TokenError::InvalidKey("ES256 needs an EC key".into()))?;
                if ec_key.group().curve_name() != Some(Nid::X9_62_PRIME256V1) {
                    return Err(TokenError::InvalidKey("ES256 needs a P-256 key".into()));
                }

                // jsonwebtoken only reads EC private keys as PKCS#8
                let pkcs8 = pkey
                    .private_key_to_pem_pkcs8()
                    .map_err(|e| TokenError::InvalidKey(e.to_string()))?;

                (
                    EncodingKey::from_ec_pem(&pkcs8)
                        .map_err(|e| TokenError::InvalidKey(e.to_string()))?,
                    DecodingKey::from_ec_pem(&public_pem)
                        .map_err(|e| TokenError::InvalidKey(e.to_string()))?,
                )
            }
            SigningAlgorithm::Rs256 => {
                if pkey.id() != Id::RSA {
                    return Err(TokenError::InvalidKey("RS256 needs an RSA key".into()));
                }

                (
                    EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
                        .map_err(|e| TokenError::InvalidKey(e.to_string()))?,
                    DecodingKey::from_rsa_pem(&public_pem)
                        .map_err(|e| TokenError::InvalidKey(e.to_string()))?,
                )
            }
        };

        let mut validation = Validation::new(algorithm.into());
        // `exp` and `nbf` are enforced to the second
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["sub", "exp", "nbf", "iat"]);

        Ok(Self {
            algorithm,
            encoding_key,
            decoding_key,
            validation,
        })
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Signs `{sub, iat, nbf, exp}` valid for [`consts::TOKEN_TTL`] from now
    pub fn create_token(&self, subject: &str) -> Result<String, TokenError> {
        self.create_token_at(subject, Utc::now())
    }

    pub(crate) fn create_token_at(
        &self,
        subject: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let ttl = TimeDelta::from_std(consts::TOKEN_TTL)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        let claims = TokenClaims {
            sub: subject.to_string(),
            iat: issued_at.timestamp(),
            nbf: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
        };

        encode(
            &Header::new(self.algorithm.into()),
            &claims,
            &self.encoding_key,
        )
        .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Checks signature, algorithm and time bounds.
    ///
    /// A token that is well formed but not acceptable gives `valid = false`.
    /// Only input that is not a JWT at all is an error.
    pub fn verify_token(&self, token: &str) -> Result<TokenVerification, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Malformed("empty token".into()));
        }

        let header = decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;

        match decode::<TokenClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(TokenVerification {
                valid: true,
                header: Some(data.header),
                claims: Some(data.claims),
            }),
            Err(err) => match err.kind() {
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => Err(TokenError::Malformed(err.to_string())),
                _ => {
                    tracing::debug!(error = %err, "token rejected");
                    Ok(TokenVerification {
                        valid: false,
                        header: Some(header),
                        claims: None,
                    })
                }
            },
        }
    }
}
