//! AWS Signature Version 4 request signing
//!
//! The management-API sender authenticates every request with a real SigV4
//! signature: canonical request, string to sign, derived HMAC-SHA256 key
//! chain, Authorization header. Placeholder access-key headers are not
//! accepted by any production edge.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-date";

/// AWS-style credentials, resolved from the environment by default
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Standard environment variable resolution; None when no credentials
    /// are configured
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;

        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

/// Headers to attach to a signed request
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub session_token: Option<String>,
}

/// Signs requests for one region/service pair
#[derive(Debug, Clone)]
pub struct RequestSigner {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

impl RequestSigner {
    pub fn new(
        credentials: AwsCredentials,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: service.into(),
        }
    }

    /// Produce the Authorization and x-amz-date headers for a request.
    ///
    /// `path` must already be URI-encoded exactly as it will be sent; the
    /// canonical request and the wire request have to match byte for byte.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> SignedHeaders {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();

        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let payload_hash = sha256_hex(payload);

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, query, canonical_headers, SIGNED_HEADERS, payload_hash
        );

        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            datestamp, self.region, self.service
        );

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key = self.derive_signing_key(&datestamp);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.credentials.access_key_id, credential_scope, SIGNED_HEADERS, signature
        );

        SignedHeaders {
            authorization,
            amz_date,
            session_token: self.credentials.session_token.clone(),
        }
    }

    /// Key derivation chain: secret -> date -> region -> service -> request
    fn derive_signing_key(&self, datestamp: &str) -> Vec<u8> {
        let secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(secret.as_bytes(), datestamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Percent-encode a single path segment per the signing canonicalization
/// rules: unreserved characters pass through, everything else becomes
/// uppercase %XX escapes.
pub fn uri_encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_signer() -> RequestSigner {
        RequestSigner::new(
            AwsCredentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY"),
            "us-east-1",
            "execute-api",
        )
    }

    #[test]
    fn test_hmac_sha256_known_vector() {
        // RFC 4231 test case 2
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sha256_empty_payload() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let signer = test_signer();
        let now = Utc.with_ymd_and_hms(2024, 8, 30, 12, 0, 0).unwrap();

        let a = signer.sign("POST", "example.amazonaws.com", "/prod/%40connections/c1", "", b"{}", now);
        let b = signer.sign("POST", "example.amazonaws.com", "/prod/%40connections/c1", "", b"{}", now);

        assert_eq!(a.authorization, b.authorization);
        assert_eq!(a.amz_date, "20240830T120000Z");
    }

    #[test]
    fn test_signature_varies_with_payload() {
        let signer = test_signer();
        let now = Utc.with_ymd_and_hms(2024, 8, 30, 12, 0, 0).unwrap();

        let a = signer.sign("POST", "example.amazonaws.com", "/", "", b"one", now);
        let b = signer.sign("POST", "example.amazonaws.com", "/", "", b"two", now);

        assert_ne!(a.authorization, b.authorization);
    }

    #[test]
    fn test_authorization_header_shape() {
        let signer = test_signer();
        let now = Utc.with_ymd_and_hms(2024, 8, 30, 12, 0, 0).unwrap();

        let signed = signer.sign("GET", "example.amazonaws.com", "/", "", b"", now);

        assert!(signed.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240830/us-east-1/execute-api/aws4_request"
        ));
        assert!(signed
            .authorization
            .contains("SignedHeaders=host;x-amz-date"));
        assert!(signed.authorization.contains("Signature="));
    }

    #[test]
    fn test_uri_encode_segment() {
        assert_eq!(uri_encode_segment("abc-123_~."), "abc-123_~.");
        assert_eq!(uri_encode_segment("L0SM9cOFvHcCIhw="), "L0SM9cOFvHcCIhw%3D");
        assert_eq!(uri_encode_segment("a/b c"), "a%2Fb%20c");
    }

    #[test]
    fn test_credentials_carry_session_token() {
        let mut creds = AwsCredentials::new("key", "secret");
        creds.session_token = Some("token".to_string());

        let signer = RequestSigner::new(creds, "us-east-1", "execute-api");
        let now = Utc.with_ymd_and_hms(2024, 8, 30, 12, 0, 0).unwrap();
        let signed = signer.sign("GET", "example.amazonaws.com", "/", "", b"", now);

        assert_eq!(signed.session_token.as_deref(), Some("token"));
    }
}
