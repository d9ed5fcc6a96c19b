//! S3 object store.
//!
//! Talks to the S3 REST API directly with AWS Signature V4, using only the
//! pure-Rust `hmac` and `sha2` crates for signing. Virtual-hosted addressing
//! is used against AWS; a custom `endpoint_url` (MinIO, LocalStack) switches
//! to path-style addressing on that host.
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and,
//! optionally, `AWS_SESSION_TOKEN`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};

use casechunk_core::objects::{ObjectMeta, ObjectStore};

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Where requests go: scheme, host header and the path prefix before the key.
#[derive(Debug, PartialEq, Eq)]
struct Endpoint {
    scheme: &'static str,
    host: String,
    base_path: String,
}

fn resolve_endpoint(bucket: &str, region: &str, endpoint_url: Option<&str>) -> Endpoint {
    match endpoint_url {
        Some(url) => {
            let scheme = if url.starts_with("http://") {
                "http"
            } else {
                "https"
            };
            let host = url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
            Endpoint {
                scheme,
                host,
                base_path: format!("/{}", uri_encode(bucket)),
            }
        }
        None => Endpoint {
            scheme: "https",
            host: format!("{}.s3.{}.amazonaws.com", bucket, region),
            base_path: String::new(),
        },
    }
}

pub struct S3ObjectStore {
    bucket: String,
    region: String,
    endpoint: Endpoint,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3ObjectStore {
    pub fn from_config(storage: &StorageConfig) -> Result<Self> {
        let region = storage
            .region
            .clone()
            .ok_or_else(|| anyhow!("storage.region must be set for the s3 backend"))?;
        let endpoint = resolve_endpoint(&storage.bucket, &region, storage.endpoint_url.as_deref());
        Ok(Self {
            bucket: storage.bucket.clone(),
            region,
            endpoint,
            creds: AwsCredentials::from_env()?,
            client: reqwest::Client::new(),
        })
    }

    /// Sign and send one request. `query` pairs are encoded and sorted here.
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        let canonical_uri = format!("{}/{}", self.endpoint.base_path, encoded_key);

        let mut sorted: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        sorted.sort();
        let canonical_querystring = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), self.endpoint.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!(
            "{}://{}{}",
            self.endpoint.scheme, self.endpoint.host, canonical_uri
        );
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        req.send()
            .await
            .map_err(|e| anyhow!("S3 request to s3://{}{} failed: {}", self.bucket, canonical_uri, e))
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    resp.text()
        .await
        .unwrap_or_default()
        .chars()
        .take(500)
        .collect()
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &str {
        "s3"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let resp = self.send(Method::PUT, Some(key), &[], bytes.to_vec()).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            bail!("S3 PutObject failed (HTTP {}) for key '{}': {}", status, key, error_body(resp).await);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.send(Method::GET, Some(key), &[], Vec::new()).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", status, key);
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self.send(Method::DELETE, Some(key), &[], Vec::new()).await?;
        let status = resp.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            bail!("S3 DeleteObject failed (HTTP {}) for key '{}'", status, key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![("list-type", "2"), ("max-keys", "1000"), ("prefix", prefix)];
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token", token.as_str()));
            }

            let resp = self.send(Method::GET, None, &query, Vec::new()).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    error_body(resp).await
                );
            }

            let xml = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml);
            objects.extend(batch);

            match (is_truncated, next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow!("invalid HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding: everything but `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ ListObjectsV2 parsing ============

fn parse_list_objects_response(xml: &str) -> (Vec<ObjectMeta>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated").is_some_and(|v| v == "true");
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut objects = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        let last_modified = extract_xml_value(block, "LastModified")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let size = extract_xml_value(block, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        objects.push(ObjectMeta {
            key: xml_unescape(&key),
            size,
            last_modified,
        });
    }

    (objects, is_truncated, next_token)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let value_start = xml.find(&open)? + open.len();
    let end = xml[value_start..].find(&close)?;
    Some(xml[value_start..value_start + end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
