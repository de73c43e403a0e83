use crate::config::ClaimNames;
use crate::error::AuthError;
use serde_json::{Map, Value};

const ISSUER: &str = "iss";
const ISSUED_AT: &str = "iat";
const EXPIRES_AT: &str = "exp";
const USERNAME_FALLBACK: &str = "preferred_username";

/// Identity extracted from a verified token. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub subject: String,
    pub username: Option<String>,
    pub issuer: String,
    /// Issuer order, duplicates removed.
    pub roles: Vec<String>,
    pub tenant_id: Option<String>,
    pub issued_at: Option<u64>,
    /// Unix seconds.
    pub expires_at: u64,
    /// Every claim not mapped to a field above.
    pub additional: Map<String, Value>,
}

impl Claims {
    /// Build claims from a verified payload using the configured claim names.
    pub fn from_payload(mut payload: Map<String, Value>, names: &ClaimNames) -> Result<Self, AuthError> {
        let subject = match payload.remove(&names.subject) {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(AuthError::Malformed(format!(
                    "missing '{}' claim",
                    names.subject
                )))
            }
        };

        let expires_at = payload
            .remove(EXPIRES_AT)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| AuthError::Malformed("missing 'exp' claim".to_string()))?;

        let issuer = payload
            .remove(ISSUER)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let issued_at = payload.remove(ISSUED_AT).and_then(|v| v.as_u64());

        let username = take_string(&mut payload, &names.username)
            .or_else(|| take_string(&mut payload, USERNAME_FALLBACK));
        let tenant_id = take_string(&mut payload, &names.tenant);
        let roles = payload
            .remove(&names.roles)
            .map(parse_roles)
            .unwrap_or_default();

        Ok(Self {
            subject,
            username,
            issuer,
            roles,
            tenant_id,
            issued_at,
            expires_at,
            additional: payload,
        })
    }

    pub fn is_expired_at(&self, now_unix: u64) -> bool {
        now_unix >= self.expires_at
    }

    /// Roles joined for the `X-Roles` header.
    pub fn joined_roles(&self) -> String {
        self.roles.join(",")
    }
}

fn take_string(payload: &mut Map<String, Value>, key: &str) -> Option<String> {
    match payload.remove(key)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Roles arrive either as a JSON array or as one comma/space separated string.
/// The issuer's order is kept; repeats after the first are dropped.
fn parse_roles(v: Value) -> Vec<String> {
    let names: Vec<String> = match v {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|i| match i {
                Value::String(s) => Some(s.trim().to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    let mut roles: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !name.is_empty() && !roles.contains(&name) {
            roles.push(name);
        }
    }
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_from_payload_default_names() {
        let claims = Claims::from_payload(
            payload(json!({
                "sub": "42",
                "username": "alice",
                "iss": "main",
                "roles": ["admin", "ops", "admin"],
                "tenant_id": "t1",
                "iat": 1000,
                "exp": 2000,
                "scope": "read"
            })),
            &ClaimNames::default(),
        )
        .unwrap();
        assert_eq!(claims.subject, "42");
        assert_eq!(claims.username.as_deref(), Some("alice"));
        assert_eq!(claims.issuer, "main");
        assert_eq!(claims.joined_roles(), "admin,ops");
        assert_eq!(claims.tenant_id.as_deref(), Some("t1"));
        assert_eq!(claims.issued_at, Some(1000));
        assert_eq!(claims.expires_at, 2000);
        assert_eq!(claims.additional.get("scope"), Some(&json!("read")));
        assert!(!claims.additional.contains_key("sub"));
    }

    #[test]
    fn test_roles_keep_issuer_order() {
        let claims = Claims::from_payload(
            payload(json!({
                "sub": "1",
                "roles": ["writer", "admin", "writer", " ", "reader"],
                "exp": 10
            })),
            &ClaimNames::default(),
        )
        .unwrap();
        assert_eq!(claims.roles, vec!["writer", "admin", "reader"]);
        assert_eq!(claims.joined_roles(), "writer,admin,reader");

        let claims = Claims::from_payload(
            payload(json!({"sub": "1", "roles": "ops admin,ops", "exp": 10})),
            &ClaimNames::default(),
        )
        .unwrap();
        assert_eq!(claims.joined_roles(), "ops,admin");
    }

    #[test]
    fn test_custom_claim_names() {
        let names = ClaimNames {
            subject: "uid".into(),
            username: "name".into(),
            roles: "authorities".into(),
            tenant: "org".into(),
        };
        let claims = Claims::from_payload(
            payload(json!({
                "uid": 7,
                "name": "bob",
                "authorities": "reader, writer",
                "org": "acme",
                "exp": 10
            })),
            &names,
        )
        .unwrap();
        assert_eq!(claims.subject, "7");
        assert_eq!(claims.username.as_deref(), Some("bob"));
        assert_eq!(claims.joined_roles(), "reader,writer");
        assert_eq!(claims.tenant_id.as_deref(), Some("acme"));
    }

    #[test]
    fn test_preferred_username_fallback() {
        let claims = Claims::from_payload(
            payload(json!({"sub": "1", "preferred_username": "carol", "exp": 10})),
            &ClaimNames::default(),
        )
        .unwrap();
        assert_eq!(claims.username.as_deref(), Some("carol"));
    }

    #[test]
    fn test_missing_subject_is_malformed() {
        let err = Claims::from_payload(payload(json!({"exp": 10})), &ClaimNames::default())
            .unwrap_err();
        assert_eq!(err.code(), "TOKEN_MALFORMED");
    }

    #[test]
    fn test_expiry_boundary() {
        let claims = Claims::from_payload(
            payload(json!({"sub": "1", "exp": 100})),
            &ClaimNames::default(),
        )
        .unwrap();
        assert!(!claims.is_expired_at(99));
        assert!(claims.is_expired_at(100));
    }
}
