//! Signed HTTP operations against an S3-compatible endpoint. Uses a
//! blocking `reqwest::Client`, matching the teacher's otherwise
//! synchronous style layered under the worker pool (§5: long-running S3
//! operations run as pool tasks, not on an async runtime).

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;

use crate::error::{VaultError, VaultResult};
use crate::s3::sigv4::{self, UNSIGNED_PAYLOAD};
use crate::s3::xml::{parse_list_bucket_result, ListBucketResult};

pub const MULTIPART_CUTOFF_BYTES: u64 = 5 * 1024 * 1024;
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct S3Object {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

pub struct S3Client {
    http: Client,
    creds: S3Credentials,
    bucket: String,
}

impl S3Client {
    pub fn new(creds: S3Credentials, bucket: String) -> S3Client {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client builds with default TLS backend");
        S3Client { http, creds, bucket }
    }

    fn host(&self) -> String {
        format!("{}.{}", self.bucket, self.creds.endpoint)
    }

    fn url(&self, key: &str) -> String {
        format!("https://{}/{}", self.host(), encode_path(key))
    }

    fn signed_headers(
        &self,
        method: &str,
        key: &str,
        extra: &[(String, String)],
        payload_hash: &str,
    ) -> Vec<(String, String)> {
        let host = self.host();
        let canonical_uri = format!("/{}", encode_path(key));
        sigv4::sign(
            &self.creds,
            method,
            &host,
            &canonical_uri,
            "",
            extra,
            payload_hash,
            Utc::now(),
        )
        .headers
    }

    fn apply_headers(
        &self,
        builder: reqwest::blocking::RequestBuilder,
        headers: &[(String, String)],
    ) -> reqwest::blocking::RequestBuilder {
        let mut builder = builder;
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder
    }

    /// `size < 5 MiB` uses a single PUT; otherwise a multipart upload.
    pub fn upload_object(
        &self,
        key: &str,
        bytes: &[u8],
        user_metadata: &HashMap<String, String>,
    ) -> VaultResult<()> {
        if (bytes.len() as u64) < MULTIPART_CUTOFF_BYTES {
            self.put_object(key, bytes, user_metadata)
        } else {
            self.upload_large_object(key, bytes, user_metadata)
        }
    }

    fn put_object(&self, key: &str, bytes: &[u8], user_metadata: &HashMap<String, String>) -> VaultResult<()> {
        let payload_hash = sigv4::sha256_hex(bytes);
        let mut extra: Vec<(String, String)> = user_metadata
            .iter()
            .map(|(k, v)| (format!("x-amz-meta-{}", k), v.clone()))
            .collect();
        extra.sort();
        let headers = self.signed_headers("PUT", key, &extra, &payload_hash);
        let resp = self
            .apply_headers(self.http.put(self.url(key)), &headers)
            .body(bytes.to_vec())
            .send()?;
        ensure_success(resp)?;
        Ok(())
    }

    /// `initiate -> loop { upload 5-MiB+ parts, collect ETags } -> complete`.
    /// On any part error, the upload is aborted to avoid orphan parts.
    fn upload_large_object(
        &self,
        key: &str,
        bytes: &[u8],
        user_metadata: &HashMap<String, String>,
    ) -> VaultResult<()> {
        let upload_id = self.initiate_multipart(key, user_metadata)?;
        let mut etags = Vec::new();
        let result: VaultResult<()> = (|| {
            let mut offset = 0usize;
            let mut part_number = 1u32;
            while offset < bytes.len() {
                let end = (offset + MIN_PART_SIZE as usize).min(bytes.len());
                let part = &bytes[offset..end];
                let etag = self.upload_part(key, &upload_id, part_number, part)?;
                etags.push((part_number, etag));
                offset = end;
                part_number += 1;
            }
            Ok(())
        })();
        match result {
            Ok(()) => self.complete_multipart(key, &upload_id, &etags),
            Err(err) => {
                let _ = self.abort_multipart(key, &upload_id);
                Err(err)
            }
        }
    }

    fn initiate_multipart(&self, key: &str, user_metadata: &HashMap<String, String>) -> VaultResult<String> {
        let mut extra: Vec<(String, String)> = user_metadata
            .iter()
            .map(|(k, v)| (format!("x-amz-meta-{}", k), v.clone()))
            .collect();
        extra.sort();
        let headers = self.signed_headers("POST", &format!("{}?uploads", key), &extra, UNSIGNED_PAYLOAD);
        let resp = self
            .apply_headers(self.http.post(format!("{}?uploads", self.url(key))), &headers)
            .send()?;
        let body = ensure_success(resp)?;
        extract_xml_tag(&body, "UploadId")
            .ok_or_else(|| VaultError::FatalIo("InitiateMultipartUpload missing UploadId".to_string()))
    }

    fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, bytes: &[u8]) -> VaultResult<String> {
        let payload_hash = sigv4::sha256_hex(bytes);
        let path = format!("{}?partNumber={}&uploadId={}", key, part_number, upload_id);
        let headers = self.signed_headers("PUT", &path, &[], &payload_hash);
        let resp = self
            .apply_headers(self.http.put(format!("{}?partNumber={}&uploadId={}", self.url(key), part_number, upload_id)), &headers)
            .body(bytes.to_vec())
            .send()?;
        let resp = ensure_success_response(resp)?;
        resp.headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| VaultError::FatalIo("UploadPart response missing ETag".to_string()))
    }

    fn complete_multipart(&self, key: &str, upload_id: &str, etags: &[(u32, String)]) -> VaultResult<()> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for (part_number, etag) in etags {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part_number, etag
            ));
        }
        body.push_str("</CompleteMultipartUpload>");
        let payload_hash = sigv4::sha256_hex(body.as_bytes());
        let path = format!("{}?uploadId={}", key, upload_id);
        let headers = self.signed_headers("POST", &path, &[], &payload_hash);
        let resp = self
            .apply_headers(self.http.post(format!("{}?uploadId={}", self.url(key), upload_id)), &headers)
            .body(body)
            .send()?;
        ensure_success(resp)?;
        Ok(())
    }

    fn abort_multipart(&self, key: &str, upload_id: &str) -> VaultResult<()> {
        let path = format!("{}?uploadId={}", key, upload_id);
        let headers = self.signed_headers("DELETE", &path, &[], UNSIGNED_PAYLOAD);
        let resp = self
            .apply_headers(self.http.delete(format!("{}?uploadId={}", self.url(key), upload_id)), &headers)
            .send()?;
        ensure_success(resp)?;
        Ok(())
    }

    /// Streams the object to a temporary sibling, fsyncs, then renames
    /// atomically over `dest`.
    pub fn download_object(&self, key: &str, dest: &Path) -> VaultResult<()> {
        let headers = self.signed_headers("GET", key, &[], UNSIGNED_PAYLOAD);
        let resp = self.apply_headers(self.http.get(self.url(key)), &headers).send()?;
        let resp = ensure_success_response(resp)?;
        let tmp = dest.with_extension("part");
        {
            let mut file = std::fs::File::create(&tmp)?;
            let bytes = resp.bytes()?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, dest)?;
        Ok(())
    }

    /// Idempotent; a 404 counts as success.
    pub fn delete_object(&self, key: &str) -> VaultResult<()> {
        let headers = self.signed_headers("DELETE", key, &[], UNSIGNED_PAYLOAD);
        let resp = self.apply_headers(self.http.delete(self.url(key)), &headers).send()?;
        if resp.status() == StatusCode::NOT_FOUND || resp.status().is_success() {
            return Ok(());
        }
        Err(status_error(resp))
    }

    pub fn list_objects(&self, prefix: &str) -> VaultResult<ListBucketResult> {
        let query = format!("prefix={}", encode_component(prefix));
        let headers_path = format!("?{}", query);
        let headers = self.signed_headers("GET", &headers_path, &[], UNSIGNED_PAYLOAD);
        let resp = self
            .apply_headers(self.http.get(format!("https://{}/?{}", self.host(), query)), &headers)
            .send()?;
        let body = ensure_success(resp)?;
        parse_list_bucket_result(&body)
    }

    /// Returns user-metadata (`x-amz-meta-*` stripped of the prefix).
    pub fn head_object(&self, key: &str) -> VaultResult<HashMap<String, String>> {
        let headers = self.signed_headers("HEAD", key, &[], UNSIGNED_PAYLOAD);
        let resp = self.apply_headers(self.http.head(self.url(key)), &headers).send()?;
        let resp = ensure_success_response(resp)?;
        let mut metadata = HashMap::new();
        for (name, value) in resp.headers() {
            if let Some(meta_key) = name.as_str().strip_prefix("x-amz-meta-") {
                if let Ok(value) = value.to_str() {
                    metadata.insert(meta_key.to_string(), value.to_string());
                }
            }
        }
        Ok(metadata)
    }

    /// Implemented as a self-copy PUT with updated `x-amz-meta-*`
    /// headers, per the contract for metadata-only updates.
    pub fn set_object_user_metadata(&self, key: &str, metadata: &HashMap<String, String>) -> VaultResult<()> {
        let mut extra: Vec<(String, String)> = metadata
            .iter()
            .map(|(k, v)| (format!("x-amz-meta-{}", k), v.clone()))
            .collect();
        extra.push(("x-amz-copy-source".to_string(), format!("/{}/{}", self.bucket, encode_path(key))));
        extra.push(("x-amz-metadata-directive".to_string(), "REPLACE".to_string()));
        extra.sort();
        let headers = self.signed_headers("PUT", key, &extra, UNSIGNED_PAYLOAD);
        let resp = self.apply_headers(self.http.put(self.url(key)), &headers).send()?;
        ensure_success(resp)?;
        Ok(())
    }

    /// Regex-checks shape, then probes with ListBuckets.
    /// `AccessDenied` still counts as valid (it proves the credentials
    /// authenticated, just lack bucket-list permission).
    pub fn validate_credentials(&self) -> VaultResult<bool> {
        if self.creds.access_key.is_empty() || self.creds.secret_access_key.len() < 16 {
            return Ok(false);
        }
        let headers = self.signed_headers("GET", "", &[], UNSIGNED_PAYLOAD);
        let resp = self.apply_headers(self.http.get(format!("https://{}/", self.creds.endpoint)), &headers).send()?;
        Ok(resp.status().is_success() || resp.status() == StatusCode::FORBIDDEN)
    }
}

fn ensure_success(resp: Response) -> VaultResult<String> {
    let resp = ensure_success_response(resp)?;
    resp.text().map_err(Into::into)
}

fn ensure_success_response(resp: Response) -> VaultResult<Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(status_error(resp))
    }
}

fn status_error(resp: Response) -> VaultError {
    let status = resp.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        VaultError::TransientIo(format!("S3 {}", status))
    } else if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
        VaultError::AuthError(format!("S3 {}", status))
    } else {
        VaultError::FatalIo(format!("S3 {}", status))
    }
}

fn encode_path(key: &str) -> String {
    key.split('/').map(encode_component).collect::<Vec<_>>().join("/")
}

fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn extract_xml_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}
