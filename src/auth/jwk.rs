use jsonwebtoken::jwk::{AlgorithmParameters, Jwk};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde_json::Value;
use std::str::FromStr;

/// Asymmetric key families accepted for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec,
}

impl KeyFamily {
    /// Family implied by a token header algorithm. Symmetric and other
    /// algorithms are not accepted.
    pub fn of(alg: Algorithm) -> Option<Self> {
        match alg {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => Some(KeyFamily::Rsa),
            Algorithm::ES256 | Algorithm::ES384 => Some(KeyFamily::Ec),
            _ => None,
        }
    }
}

/// One public key from a JWKS document.
pub struct VerificationKey {
    pub kid: String,
    pub family: KeyFamily,
    /// Pinned algorithm when the JWK declares one.
    pub alg: Option<Algorithm>,
    pub key: DecodingKey,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("alg", &self.alg)
            .finish()
    }
}

/// Parse a JWKS document. Keys without a `kid`, symmetric keys and keys
/// that fail to parse are skipped; the document itself must be valid JSON
/// with a `keys` array.
pub fn parse_jwks(body: &str) -> Result<Vec<VerificationKey>, String> {
    let doc: Value = serde_json::from_str(body).map_err(|e| format!("invalid json: {}", e))?;
    let keys = doc
        .get("keys")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing 'keys' array".to_string())?;

    let mut out = Vec::with_capacity(keys.len());
    for raw in keys {
        match parse_key(raw) {
            Ok(k) => out.push(k),
            Err(reason) => tracing::debug!("auth: jwks: key skipped, reason={}", reason),
        }
    }
    Ok(out)
}

fn parse_key(raw: &Value) -> Result<VerificationKey, String> {
    let jwk: Jwk = serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
    let kid = jwk
        .common
        .key_id
        .clone()
        .ok_or_else(|| "key without kid".to_string())?;

    let family = match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => KeyFamily::Rsa,
        AlgorithmParameters::EllipticCurve(_) => KeyFamily::Ec,
        _ => return Err(format!("unsupported key type, kid={}", kid)),
    };

    let alg = raw
        .get("alg")
        .and_then(Value::as_str)
        .map(Algorithm::from_str)
        .transpose()
        .map_err(|e| format!("kid={}: {}", kid, e))?;
    if let Some(a) = alg {
        if KeyFamily::of(a) != Some(family) {
            return Err(format!("kid={}: alg does not match key type", kid));
        }
    }

    let key = DecodingKey::from_jwk(&jwk).map_err(|e| format!("kid={}: {}", kid, e))?;
    Ok(VerificationKey {
        kid,
        family,
        alg,
        key,
    })
}
