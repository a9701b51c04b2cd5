use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

/// Random URL-safe handle used for codes, opaque access tokens and ids.
pub fn random_handle() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Encode `claims` as an unsecured JWT (`alg: none`, empty signature).
///
/// The harness never signs tokens; relying parties under test are expected
/// to run with signature validation disabled or mocked.
pub fn unsigned_jwt(typ: &str, claims: &serde_json::Value) -> String {
    let header = serde_json::json!({ "alg": "none", "typ": typ });
    format!(
        "{}.{}.",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

/// Decode the claims segment of a JWT without checking any signature.
pub fn decode_claims(jwt: &str) -> Option<serde_json::Value> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_jwt_has_empty_signature() {
        let jwt = unsigned_jwt("JWT", &serde_json::json!({ "sub": "bob" }));
        assert!(jwt.ends_with('.'));
        assert_eq!(jwt.split('.').count(), 3);
        assert_eq!(decode_claims(&jwt).unwrap()["sub"], "bob");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_claims("nope").is_none());
        assert!(decode_claims("a.!!!.").is_none());
    }

    #[test]
    fn handles_are_unique() {
        assert_ne!(random_handle(), random_handle());
    }
}
