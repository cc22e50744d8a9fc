//! S3-compatible remote backend. Speaks the S3 REST API over `reqwest` with
//! SigV4-signed requests; XML payloads only where the protocol demands them.

pub mod sign;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use filegate_common::error::{FilegateError, Result};
use filegate_common::types::{CompletedPart, FileInfo, ObjectInfo, StorageUsage};
use quick_xml::de::from_str as xml_from_str;
use quick_xml::se::to_string as xml_to_string;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::traits::{ObjectStore, PartWriteDiscipline};
use sign::{Credentials, canonical_query_string, canonical_uri, sha256_hex};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const LIST_PAGE_SIZE: i32 = 1000;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl S3Config {
    /// Reads the connection settings from `FILEGATE_S3_*` environment
    /// variables, defaulting to a local MinIO-style endpoint.
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        Self {
            endpoint: var("FILEGATE_S3_ENDPOINT", "http://localhost:9000"),
            region: var("FILEGATE_S3_REGION", "us-east-1"),
            bucket: var("FILEGATE_S3_BUCKET", "filegate"),
            access_key: var("FILEGATE_S3_ACCESS_KEY", "filegate"),
            secret_key: var("FILEGATE_S3_SECRET_KEY", "filegate123"),
        }
    }
}

pub struct S3ObjectStore {
    client: reqwest::Client,
    creds: Credentials,
    bucket: String,
    base: Url,
    host: String,
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> Result<Self> {
        let base = Url::parse(&config.endpoint).map_err(|err| {
            FilegateError::InvalidArgument(format!(
                "invalid s3 endpoint {}: {err}",
                config.endpoint
            ))
        })?;
        let host = base
            .host_str()
            .ok_or_else(|| {
                FilegateError::InvalidArgument(format!(
                    "s3 endpoint has no host: {}",
                    config.endpoint
                ))
            })?
            .to_string();
        let host = match base.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };

        Ok(Self {
            client: reqwest::Client::new(),
            creds: Credentials {
                access_key: config.access_key,
                secret_key: config.secret_key,
                region: config.region,
            },
            bucket: config.bucket,
            base,
            host,
        })
    }

    fn object_path(&self, key: &str) -> String {
        format!("/{}/{key}", self.bucket)
    }

    fn bucket_path(&self) -> String {
        format!("/{}", self.bucket)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(String, String)],
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response> {
        let canonical_query = canonical_query_string(query);
        let payload_hash = sha256_hex(&body);
        let now = Utc::now();
        let signed = sign::sign_request(
            &self.creds,
            method.as_str(),
            path,
            &canonical_query,
            &self.host,
            &payload_hash,
            &now,
        );

        // The canonical query doubles as the literal request query so the
        // signature always matches what goes on the wire.
        let mut url = format!(
            "{}://{}{}",
            self.base.scheme(),
            self.host,
            canonical_uri(path)
        );
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut request = self
            .client
            .request(method, url)
            .header("authorization", signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .body(body);
        if let Some(content_type) = content_type {
            request = request.header("content-type", content_type);
        }

        request
            .send()
            .await
            .map_err(|err| FilegateError::InternalError(format!("s3 request failed: {err}")))
    }

    async fn check(&self, response: reqwest::Response, key: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FilegateError::ObjectNotFound(key.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(FilegateError::InternalError(format!(
            "s3 responded {status}: {}",
            body.chars().take(200).collect::<String>()
        )))
    }

    fn object_info_from_headers(&self, key: &str, headers: &reqwest::header::HeaderMap) -> ObjectInfo {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let size = header("content-length")
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        let last_modified = header("last-modified")
            .and_then(|value| DateTime::parse_from_rfc2822(&value).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        ObjectInfo {
            key: key.to_string(),
            size,
            etag: trim_etag(&header("etag").unwrap_or_default()),
            content_type: header("content-type").unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            last_modified,
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> Result<ListBucketResultXml> {
        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("prefix".to_string(), prefix.to_string()),
            ("max-keys".to_string(), LIST_PAGE_SIZE.to_string()),
        ];
        if let Some(delimiter) = delimiter {
            query.push(("delimiter".to_string(), delimiter.to_string()));
        }
        if let Some(token) = token {
            query.push(("continuation-token".to_string(), token.to_string()));
        }

        let response = self
            .send(
                reqwest::Method::GET,
                &self.bucket_path(),
                &query,
                Bytes::new(),
                None,
            )
            .await?;
        let response = self.check(response, prefix).await?;
        let text = response
            .text()
            .await
            .map_err(|err| FilegateError::InternalError(format!("s3 list body: {err}")))?;
        xml_from_str(&text)
            .map_err(|err| FilegateError::InternalError(format!("invalid s3 list response: {err}")))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn part_write_discipline(&self) -> PartWriteDiscipline {
        PartWriteDiscipline::Independent
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<ObjectInfo> {
        let size = data.len() as i64;
        let response = self
            .send(
                reqwest::Method::PUT,
                &self.object_path(key),
                &[],
                data,
                Some(content_type.unwrap_or(DEFAULT_CONTENT_TYPE)),
            )
            .await?;
        let response = self.check(response, key).await?;

        let mut info = self.object_info_from_headers(key, response.headers());
        info.size = size;
        Ok(info)
    }

    async fn get_object(&self, key: &str) -> Result<(ObjectInfo, Bytes)> {
        let response = self
            .send(
                reqwest::Method::GET,
                &self.object_path(key),
                &[],
                Bytes::new(),
                None,
            )
            .await?;
        let response = self.check(response, key).await?;

        let mut info = self.object_info_from_headers(key, response.headers());
        let data = response
            .bytes()
            .await
            .map_err(|err| FilegateError::InternalError(format!("s3 object body: {err}")))?;
        info.size = data.len() as i64;
        Ok((info, data))
    }

    async fn stat_object(&self, key: &str) -> Result<ObjectInfo> {
        let response = self
            .send(
                reqwest::Method::HEAD,
                &self.object_path(key),
                &[],
                Bytes::new(),
                None,
            )
            .await?;
        let response = self.check(response, key).await?;
        Ok(self.object_info_from_headers(key, response.headers()))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let response = self
            .send(
                reqwest::Method::DELETE,
                &self.object_path(key),
                &[],
                Bytes::new(),
                None,
            )
            .await?;
        self.check(response, key).await?;
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let prefix = dir_prefix(path);
        let mut files = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .list_page(&prefix, Some("/"), token.as_deref())
                .await?;

            for common in &page.common_prefixes {
                let name = common
                    .prefix
                    .strip_prefix(&prefix)
                    .unwrap_or(&common.prefix)
                    .trim_end_matches('/')
                    .to_string();
                if name.is_empty() {
                    continue;
                }
                files.push(FileInfo {
                    path: format!("/{}", common.prefix.trim_end_matches('/')),
                    name,
                    is_dir: true,
                    size: 0,
                    modified: Utc::now(),
                });
            }

            for object in &page.contents {
                let name = object.key.strip_prefix(&prefix).unwrap_or(&object.key);
                if name.is_empty() {
                    continue;
                }
                files.push(FileInfo {
                    name: name.to_string(),
                    path: format!("/{}", object.key),
                    is_dir: false,
                    size: object.size,
                    modified: object.last_modified,
                });
            }

            if !page.is_truncated {
                break;
            }
            token = page.next_continuation_token;
            if token.is_none() {
                break;
            }
        }

        files.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(files)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let query = vec![("uploads".to_string(), String::new())];
        let response = self
            .send(
                reqwest::Method::POST,
                &self.object_path(key),
                &query,
                Bytes::new(),
                Some(DEFAULT_CONTENT_TYPE),
            )
            .await?;
        let response = self.check(response, key).await?;
        let text = response
            .text()
            .await
            .map_err(|err| FilegateError::InternalError(format!("s3 initiate body: {err}")))?;
        let result: InitiateMultipartUploadResultXml = xml_from_str(&text).map_err(|err| {
            FilegateError::InternalError(format!("invalid s3 initiate response: {err}"))
        })?;
        Ok(result.upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        let query = vec![
            ("partNumber".to_string(), part_number.to_string()),
            ("uploadId".to_string(), upload_id.to_string()),
        ];
        let response = self
            .send(
                reqwest::Method::PUT,
                &self.object_path(key),
                &query,
                data,
                None,
            )
            .await?;
        let response = self.check(response, key).await?;
        let etag = response
            .headers()
            .get("etag")
            .and_then(|value| value.to_str().ok())
            .map(trim_etag)
            .ok_or_else(|| {
                FilegateError::InternalError("s3 upload-part response missing etag".to_string())
            })?;
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        let payload = CompleteMultipartUploadXml {
            parts: parts
                .into_iter()
                .map(|part| CompletePartXml {
                    part_number: part.part_number,
                    etag: part.etag,
                })
                .collect(),
        };
        let xml = xml_to_string(&payload).map_err(|err| {
            FilegateError::InternalError(format!("failed to serialize complete request: {err}"))
        })?;
        let body = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{xml}");

        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        let response = self
            .send(
                reqwest::Method::POST,
                &self.object_path(key),
                &query,
                Bytes::from(body),
                Some("application/xml"),
            )
            .await?;
        self.check(response, key).await?;

        // The completion result omits the object size; a stat fills it in.
        self.stat_object(key).await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        let response = self
            .send(
                reqwest::Method::DELETE,
                &self.object_path(key),
                &query,
                Bytes::new(),
                None,
            )
            .await?;
        self.check(response, key).await?;
        Ok(())
    }

    async fn presign_put(&self, key: &str, expires_secs: u64) -> Result<String> {
        let path = self.object_path(key);
        let query = sign::presign_query(
            &self.creds,
            "PUT",
            &path,
            &self.host,
            expires_secs,
            &Utc::now(),
        );
        Ok(format!(
            "{}://{}{}?{query}",
            self.base.scheme(),
            self.host,
            canonical_uri(&path)
        ))
    }

    async fn usage(&self) -> Result<StorageUsage> {
        let mut usage = StorageUsage::default();
        let mut token: Option<String> = None;

        loop {
            let page = self.list_page("", None, token.as_deref()).await?;
            for object in &page.contents {
                usage.total_objects += 1;
                usage.total_size += object.size;
                if object.size > usage.largest_file_size {
                    usage.largest_file_size = object.size;
                    usage.largest_file = Some(object.key.clone());
                }
            }
            if !page.is_truncated {
                break;
            }
            token = page.next_continuation_token;
            if token.is_none() {
                break;
            }
        }

        Ok(usage)
    }
}

fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

fn dir_prefix(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename = "ListBucketResult")]
struct ListBucketResultXml {
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "NextContinuationToken")]
    next_continuation_token: Option<String>,
    #[serde(rename = "Contents", default)]
    contents: Vec<ObjectContentXml>,
    #[serde(rename = "CommonPrefixes", default)]
    common_prefixes: Vec<CommonPrefixXml>,
}

#[derive(Debug, Deserialize)]
struct ObjectContentXml {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "LastModified")]
    last_modified: DateTime<Utc>,
    #[serde(rename = "Size")]
    size: i64,
}

#[derive(Debug, Deserialize)]
struct CommonPrefixXml {
    #[serde(rename = "Prefix")]
    prefix: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "InitiateMultipartUploadResult")]
struct InitiateMultipartUploadResultXml {
    #[serde(rename = "UploadId")]
    upload_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUploadXml {
    #[serde(rename = "Part")]
    parts: Vec<CompletePartXml>,
}

#[derive(Debug, Serialize)]
struct CompletePartXml {
    #[serde(rename = "PartNumber")]
    part_number: i32,
    #[serde(rename = "ETag")]
    etag: String,
}

#[cfg(test)]
mod tests {
    use super::{dir_prefix, trim_etag};

    #[test]
    fn dir_prefix_forms() {
        assert_eq!(dir_prefix("/"), "");
        assert_eq!(dir_prefix(""), "");
        assert_eq!(dir_prefix("/docs"), "docs/");
        assert_eq!(dir_prefix("docs/sub/"), "docs/sub/");
    }

    #[test]
    fn etag_quotes_trimmed() {
        assert_eq!(trim_etag("\"abc\""), "abc");
        assert_eq!(trim_etag("abc"), "abc");
    }
}
