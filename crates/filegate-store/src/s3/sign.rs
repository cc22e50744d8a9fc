//! AWS Signature Version 4 request signing for the S3 backend.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

const AWS_URI_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'!')
    .add(b'"')
    .add(b'#')
    .add(b'$')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'=')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']');

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Headers to attach to an outgoing signed request.
#[derive(Debug)]
pub struct SignedRequest {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn amz_date(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn amz_day(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%d").to_string()
}

/// Signs one request with `host`, `x-amz-content-sha256` and `x-amz-date` as
/// the signed headers.
#[allow(clippy::too_many_arguments)]
pub fn sign_request(
    creds: &Credentials,
    method: &str,
    uri_path: &str,
    canonical_query: &str,
    host: &str,
    payload_hash: &str,
    now: &DateTime<Utc>,
) -> SignedRequest {
    let date_time = amz_date(now);
    let date = amz_day(now);

    let canonical_headers = format!(
        "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{date_time}\n"
    );
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";

    let canonical_request = canonical_request(
        method,
        &canonical_uri(uri_path),
        canonical_query,
        &canonical_headers,
        signed_headers,
        payload_hash,
    );

    let scope = format!("{date}/{}/s3/aws4_request", creds.region);
    let string_to_sign = string_to_sign(&canonical_request, &date_time, &scope);
    let signing_key = signing_key(&creds.secret_key, &date, &creds.region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            creds.access_key
        ),
        amz_date: date_time,
        content_sha256: payload_hash.to_string(),
    }
}

/// Builds a presigned URL query string (signature included) for the given
/// request. The caller appends it to `scheme://host{uri_path}`.
pub fn presign_query(
    creds: &Credentials,
    method: &str,
    uri_path: &str,
    host: &str,
    expires_secs: u64,
    now: &DateTime<Utc>,
) -> String {
    let date_time = amz_date(now);
    let date = amz_day(now);
    let scope = format!("{date}/{}/s3/aws4_request", creds.region);

    let params = vec![
        (
            "X-Amz-Algorithm".to_string(),
            "AWS4-HMAC-SHA256".to_string(),
        ),
        (
            "X-Amz-Credential".to_string(),
            format!("{}/{scope}", creds.access_key),
        ),
        ("X-Amz-Date".to_string(), date_time.clone()),
        ("X-Amz-Expires".to_string(), expires_secs.to_string()),
        ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
    ];
    let canonical_query = canonical_query_string(&params);

    let canonical_headers = format!("host:{host}\n");
    let canonical_request = canonical_request(
        method,
        &canonical_uri(uri_path),
        &canonical_query,
        &canonical_headers,
        "host",
        UNSIGNED_PAYLOAD,
    );

    let string_to_sign = string_to_sign(&canonical_request, &date_time, &scope);
    let signing_key = signing_key(&creds.secret_key, &date, &creds.region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!("{canonical_query}&X-Amz-Signature={signature}")
}

pub fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let starts_with_slash = path.starts_with('/');
    let ends_with_slash = path.ends_with('/');
    let encoded_segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(percent_encode)
        .collect::<Vec<_>>();

    let mut out = String::new();
    if starts_with_slash {
        out.push('/');
    }
    out.push_str(&encoded_segments.join("/"));
    if ends_with_slash && !out.ends_with('/') {
        out.push('/');
    }
    if out.is_empty() { "/".to_string() } else { out }
}

/// Percent-encodes and sorts name/value pairs into canonical form. The same
/// string is used for signing and as the literal request query, so the two
/// can never disagree.
pub fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded = params
        .iter()
        .map(|(name, value)| (percent_encode(name), percent_encode(value)))
        .collect::<Vec<_>>();

    encoded.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    encoded
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_request(
    method: &str,
    uri: &str,
    query_string: &str,
    canonical_headers: &str,
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    format!(
        "{method}\n{uri}\n{query_string}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    )
}

fn string_to_sign(canonical_request: &str, date_time: &str, scope: &str) -> String {
    let canonical_hash = sha256_hex(canonical_request.as_bytes());
    format!("AWS4-HMAC-SHA256\n{date_time}\n{scope}\n{canonical_hash}")
}

fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let date_key = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let region_key = hmac_sha256(&date_key, region.as_bytes());
    let service_key = hmac_sha256(&region_key, service.as_bytes());
    hmac_sha256(&service_key, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, AWS_URI_ENCODE_SET).to_string()
}
