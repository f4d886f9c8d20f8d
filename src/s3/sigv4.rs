//! AWS Signature Version 4 request signing.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::s3::client::S3Credentials;

pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const SERVICE: &str = "s3";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

type HmacSha256 = Hmac<Sha256>;

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret: &str, date_stamp: &str, region: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

pub struct SignedRequest {
    pub headers: Vec<(String, String)>,
}

/// Signs a request. `canonical_uri` must already be URI-encoded;
/// `query_string` is the canonical (sorted, encoded) query string or
/// empty. `payload_hash` should be the hex SHA-256 of the body, or
/// [`UNSIGNED_PAYLOAD`] for credential-validation probes.
#[allow(clippy::too_many_arguments)]
pub fn sign(
    creds: &S3Credentials,
    method: &str,
    host: &str,
    canonical_uri: &str,
    query_string: &str,
    extra_headers: &[(String, String)],
    payload_hash: &str,
    now: DateTime<Utc>,
) -> SignedRequest {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let mut headers: Vec<(String, String)> = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    headers.extend(extra_headers.iter().cloned());
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k.to_lowercase(), v.trim()))
        .collect();
    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.to_lowercase())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, query_string, canonical_headers, signed_headers, payload_hash
    );
    let hashed_canonical_request = sha256_hex(canonical_request.as_bytes());

    let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, creds.region, SERVICE);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM, amz_date, credential_scope, hashed_canonical_request
    );

    let key = signing_key(&creds.secret_access_key, &date_stamp, &creds.region);
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, creds.access_key, credential_scope, signed_headers, signature
    );

    let mut result_headers = headers;
    result_headers.push(("Authorization".to_string(), authorization));
    SignedRequest { headers: result_headers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn signing_is_deterministic_for_fixed_inputs() {
        let creds = S3Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
            region: "us-east-1".to_string(),
            endpoint: "s3.amazonaws.com".to_string(),
        };
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let a = sign(&creds, "GET", "s3.amazonaws.com", "/", "", &[], UNSIGNED_PAYLOAD, now);
        let b = sign(&creds, "GET", "s3.amazonaws.com", "/", "", &[], UNSIGNED_PAYLOAD, now);
        assert_eq!(
            a.headers.iter().find(|(k, _)| k == "Authorization"),
            b.headers.iter().find(|(k, _)| k == "Authorization")
        );
    }
}
