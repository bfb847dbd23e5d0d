//! S3 REST client: presigned requests via rusty-s3 driven through reqwest,
//! with per-operation retry and error translation at the boundary.
use crate::{
    client::{CompletedPart, HeadResult, ListPage, ObjectClient, ObjectEntry},
    config::{config, ClientCacheMode},
    retry,
    stream::pool::block_on,
    Error, Result,
};
use bytes::Bytes;
use reqwest::{header, StatusCode};
use ring::{digest, hmac};
use rusty_s3::{
    actions::{
        AbortMultipartUpload, CompleteMultipartUpload, CreateMultipartUpload, DeleteObject,
        GetObject, HeadObject, ListObjectsV2, PutObject, UploadPart,
    },
    Bucket, Credentials, S3Action, UrlStyle,
};
use scc::HashMap as ConcurrentMap;
use std::{
    env,
    io::Write,
    sync::{Arc, OnceLock},
    thread::{self, ThreadId},
    time::Duration,
};
use url::Url;

const SIGN_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_ENDPOINT: &str = "https://s3.amazonaws.com";
const DEFAULT_REGION: &str = "us-east-1";

/// Raw request failure, kept inside `Error::Unknown` so the retry predicate
/// can see the status and code after translation.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RequestFailure {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}, code: {code:?}, message: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },
}

/// Pull the `<Code>` out of an S3 XML error body.
fn xml_text(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

/// Map a request failure onto the neutral taxonomy.
pub(crate) fn translate_s3_failure(failure: RequestFailure, path: &str, endpoint: &str) -> Error {
    match &failure {
        RequestFailure::Status { status, code, message } => {
            let code = code.as_deref();
            match (status, code) {
                (_, Some("NoSuchBucket")) => Error::BucketNotFound {
                    path: path.to_string(),
                },
                (404, _) | (_, Some("NoSuchKey")) => Error::NotFound {
                    path: path.to_string(),
                },
                (401 | 403, _) | (_, Some("AccessDenied")) => Error::PermissionDenied {
                    path: path.to_string(),
                    detail: format!(
                        "code: {:?}, message: {:?}, endpoint: {:?}",
                        code.unwrap_or("Unknown"),
                        message,
                        endpoint
                    ),
                },
                (_, Some("InvalidAccessKeyId" | "SignatureDoesNotMatch")) => Error::Misconfigured {
                    detail: format!(
                        "invalid credentials for {path:?}, code: {:?}, endpoint: {:?}",
                        code.unwrap_or("Unknown"),
                        endpoint
                    ),
                },
                _ => Error::unknown(
                    format!("{path}, endpoint: {endpoint}"),
                    anyhow::Error::new(failure),
                ),
            }
        }
        RequestFailure::Transport(_) => Error::unknown(
            format!("{path}, endpoint: {endpoint}"),
            anyhow::Error::new(failure),
        ),
    }
}

/// Transient-failure predicate for object-store requests.
pub(crate) fn s3_should_retry(err: &Error) -> bool {
    let Error::Unknown { source, .. } = err else {
        return false;
    };
    if let Some(failure) = source.downcast_ref::<RequestFailure>() {
        return match failure {
            RequestFailure::Transport(err) => {
                err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
            }
            RequestFailure::Status { status, code, .. } => {
                (500..=599).contains(status)
                    || matches!(code.as_deref(), Some("InternalError" | "500"))
            }
        };
    }
    false
}

/// Credentials/endpoint bundle resolved from the environment, honoring the
/// `<PROFILE>__<NAME>` per-profile variables.
#[derive(Debug, Clone)]
pub struct S3Profile {
    pub profile: Option<String>,
    pub endpoint: Url,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub url_style: UrlStyle,
}

fn profile_var(profile: Option<&str>, name: &str) -> Option<String> {
    if let Some(profile) = profile {
        let scoped = format!("{}__{name}", profile.to_uppercase());
        if let Ok(value) = env::var(&scoped) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    env::var(name).ok().filter(|value| !value.is_empty())
}

impl S3Profile {
    pub fn from_env(profile: Option<&str>) -> Result<S3Profile> {
        let access_key =
            profile_var(profile, "AWS_ACCESS_KEY_ID").ok_or_else(|| Error::Misconfigured {
                detail: "AWS_ACCESS_KEY_ID is not set".to_string(),
            })?;
        let secret_key =
            profile_var(profile, "AWS_SECRET_ACCESS_KEY").ok_or_else(|| Error::Misconfigured {
                detail: "AWS_SECRET_ACCESS_KEY is not set".to_string(),
            })?;

        let custom_endpoint = profile_var(profile, "OSS_ENDPOINT");
        let url_style = if custom_endpoint.is_some() {
            UrlStyle::Path
        } else {
            UrlStyle::VirtualHost
        };
        let endpoint = custom_endpoint
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
            .parse::<Url>()
            .map_err(|err| Error::Misconfigured {
                detail: format!("invalid endpoint: {err}"),
            })?;
        let region =
            profile_var(profile, "AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());

        Ok(S3Profile {
            profile: profile.map(str::to_string),
            endpoint,
            region,
            access_key,
            secret_key,
            url_style,
        })
    }
}

pub struct S3Client {
    profile: S3Profile,
    credentials: Credentials,
    http: reqwest::Client,
    buckets: ConcurrentMap<String, Arc<Bucket>>,
    max_retries: usize,
}

impl S3Client {
    pub fn new(profile: S3Profile) -> Result<S3Client> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| Error::Misconfigured {
                detail: format!("failed to build http client: {err}"),
            })?;
        let credentials = Credentials::new(
            profile.access_key.clone(),
            profile.secret_key.clone(),
        );
        Ok(S3Client {
            profile,
            credentials,
            http,
            buckets: ConcurrentMap::new(),
            max_retries: config().s3_max_retry_times,
        })
    }

    pub fn from_env(profile: Option<&str>) -> Result<S3Client> {
        Ok(S3Client::new(S3Profile::from_env(profile)?)?)
    }

    fn path(&self, bucket: &str, key: &str) -> String {
        match &self.profile.profile {
            Some(profile) => format!("s3+{profile}://{bucket}/{key}"),
            None => format!("s3://{bucket}/{key}"),
        }
    }

    fn bucket(&self, name: &str) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.buckets.read(name, |_, bucket| bucket.clone()) {
            return Ok(bucket);
        }
        let bucket = Bucket::new(
            self.profile.endpoint.clone(),
            self.profile.url_style,
            name.to_string(),
            self.profile.region.clone(),
        )
        .map_err(|err| Error::Misconfigured {
            detail: format!("invalid bucket {name:?}: {err}"),
        })?;
        let bucket = Arc::new(bucket);
        let _ = self.buckets.insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }

    /// Drive one signed request, translating transport and status failures.
    /// Success responses come back with their body read.
    fn send(
        &self,
        path: &str,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<(StatusCode, header::HeaderMap, Bytes)> {
        retry::execute(self.max_retries, s3_should_retry, || {
            block_on(async {
                let response = build(&self.http)
                    .send()
                    .await
                    .map_err(|err| self.raw(path, err.into()))?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response
                    .bytes()
                    .await
                    .map_err(|err| self.raw(path, err.into()))?;
                if status.is_success() {
                    Ok((status, headers, body))
                } else {
                    let text = String::from_utf8_lossy(&body);
                    Err(self.raw(
                        path,
                        RequestFailure::Status {
                            status: status.as_u16(),
                            code: xml_text(&text, "Code"),
                            message: xml_text(&text, "Message")
                                .unwrap_or_else(|| text.into_owned()),
                        },
                    ))
                }
            })
        })
    }

    fn raw(&self, path: &str, failure: RequestFailure) -> Error {
        translate_s3_failure(failure, path, self.profile.endpoint.as_str())
    }

    fn host_header(&self, url: &Url) -> String {
        let host = url.host_str().unwrap_or_default();
        match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Query-presign a GET of the service root; rusty-s3 has no action for
    /// the account-level `ListBuckets`.
    fn presign_list_buckets(&self) -> Url {
        let now = chrono::Utc::now();
        let date = now.format("%Y%m%d").to_string();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{date}/{}/s3/aws4_request", self.profile.region);
        let credential = format!("{}/{scope}", self.profile.access_key);

        let mut url = self.profile.endpoint.clone();
        url.set_path("/");
        let host = self.host_header(&url);

        // query keys in canonical (sorted) order
        let query = format!(
            "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential={}&X-Amz-Date={timestamp}&X-Amz-Expires=60&X-Amz-SignedHeaders=host",
            credential.replace('/', "%2F")
        );
        let canonical_request =
            format!("GET\n/\n{query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD");
        let hashed = hex::encode(digest::digest(&digest::SHA256, canonical_request.as_bytes()));
        let string_to_sign =
            format!("AWS4-HMAC-SHA256\n{timestamp}\n{scope}\n{hashed}");

        let mut key = hmac::Key::new(
            hmac::HMAC_SHA256,
            format!("AWS4{}", self.profile.secret_key).as_bytes(),
        );
        for part in [
            date.as_str(),
            self.profile.region.as_str(),
            "s3",
            "aws4_request",
        ] {
            key = hmac::Key::new(hmac::HMAC_SHA256, hmac::sign(&key, part.as_bytes()).as_ref());
        }
        let signature = hex::encode(hmac::sign(&key, string_to_sign.as_bytes()));

        url.set_query(Some(&format!("{query}&X-Amz-Signature={signature}")));
        url
    }
}

fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

fn parse_http_mtime(value: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|parsed| parsed.timestamp() as f64)
}

fn parse_iso_mtime(value: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.timestamp() as f64 + parsed.timestamp_subsec_millis() as f64 / 1000.0)
}

fn header_str<'h>(headers: &'h header::HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

impl ObjectClient for S3Client {
    fn endpoint(&self) -> String {
        self.profile.endpoint.to_string()
    }

    fn head_object(&self, bucket: &str, key: &str) -> Result<HeadResult> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let url = HeadObject::new(&bucket, Some(&self.credentials), key).sign(SIGN_DURATION);

        let (_status, headers, _body) = self.send(&path, |http| http.head(url.clone()))?;
        let size = header_str(&headers, "content-length")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let mut extra = std::collections::HashMap::new();
        for name in ["content-type", "x-amz-storage-class", "x-amz-version-id"] {
            if let Some(value) = header_str(&headers, name) {
                extra.insert(name.to_string(), value.to_string());
            }
        }
        Ok(HeadResult {
            size,
            mtime: header_str(&headers, "last-modified").and_then(parse_http_mtime),
            etag: header_str(&headers, "etag").map(normalize_etag),
            extra,
        })
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<(Bytes, Option<String>)> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let url = GetObject::new(&bucket, Some(&self.credentials), key).sign(SIGN_DURATION);

        let (_status, headers, body) = self.send(&path, |http| {
            let request = http.get(url.clone());
            match range {
                Some((start, end)) => {
                    request.header(header::RANGE, format!("bytes={start}-{end}"))
                }
                None => request,
            }
        })?;
        Ok((body, header_str(&headers, "etag").map(normalize_etag)))
    }

    fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let url = PutObject::new(&bucket, Some(&self.credentials), key).sign(SIGN_DURATION);

        self.send(&path, |http| http.put(url.clone()).body(body.clone()))?;
        Ok(())
    }

    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        let path = self.path(dst_bucket, dst_key);
        let bucket = self.bucket(dst_bucket)?;
        let url = PutObject::new(&bucket, Some(&self.credentials), dst_key).sign(SIGN_DURATION);
        let source = format!("/{src_bucket}/{src_key}");

        let (_status, _headers, body) = self.send(&path, |http| {
            http.put(url.clone())
                .header("x-amz-copy-source", source.clone())
        })?;
        // a copy can fail with a 200 carrying an error document
        let text = String::from_utf8_lossy(&body);
        if let Some(code) = xml_text(&text, "Code") {
            return Err(self.raw(
                &path,
                RequestFailure::Status {
                    status: 200,
                    code: Some(code),
                    message: xml_text(&text, "Message").unwrap_or_default(),
                },
            ));
        }
        Ok(())
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let url = DeleteObject::new(&bucket, Some(&self.credentials), key).sign(SIGN_DURATION);

        self.send(&path, |http| http.delete(url.clone()))?;
        Ok(())
    }

    fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let url =
            CreateMultipartUpload::new(&bucket, Some(&self.credentials), key).sign(SIGN_DURATION);

        let (_status, _headers, body) = self.send(&path, |http| http.post(url.clone()))?;
        let text = String::from_utf8_lossy(&body);
        let parsed = CreateMultipartUpload::parse_response(&text).map_err(|err| {
            Error::unknown(path.clone(), anyhow::anyhow!("bad multipart response: {err}"))
        })?;
        Ok(parsed.upload_id().to_string())
    }

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> Result<String> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let url = UploadPart::new(
            &bucket,
            Some(&self.credentials),
            key,
            part_number,
            upload_id,
        )
        .sign(SIGN_DURATION);

        let (_status, headers, _body) =
            self.send(&path, |http| http.put(url.clone()).body(body.clone()))?;
        header_str(&headers, "etag")
            .map(normalize_etag)
            .ok_or_else(|| {
                Error::unknown(path.clone(), anyhow::anyhow!("upload part response had no etag"))
            })
    }

    fn upload_part_copy(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u16,
        src_bucket: &str,
        src_key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<String> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let url = UploadPart::new(
            &bucket,
            Some(&self.credentials),
            key,
            part_number,
            upload_id,
        )
        .sign(SIGN_DURATION);
        let source = format!("/{src_bucket}/{src_key}");

        let (_status, _headers, body) = self.send(&path, |http| {
            let request = http
                .put(url.clone())
                .header("x-amz-copy-source", source.clone());
            match range {
                Some((start, end)) => request.header(
                    "x-amz-copy-source-range",
                    format!("bytes={start}-{end}"),
                ),
                None => request,
            }
        })?;
        let text = String::from_utf8_lossy(&body);
        xml_text(&text, "ETag")
            .map(|etag| normalize_etag(&etag))
            .ok_or_else(|| {
                Error::unknown(path.clone(), anyhow::anyhow!("part copy response had no etag"))
            })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let etags: Vec<String> = parts.iter().map(|part| part.etag.clone()).collect();
        let action = CompleteMultipartUpload::new(
            &bucket,
            Some(&self.credentials),
            key,
            upload_id,
            etags.iter().map(String::as_str),
        );
        let url = action.sign(SIGN_DURATION);
        let payload = action.body();

        let (_status, _headers, body) =
            self.send(&path, |http| http.post(url.clone()).body(payload.clone()))?;
        let text = String::from_utf8_lossy(&body);
        if let Some(code) = xml_text(&text, "Code") {
            return Err(self.raw(
                &path,
                RequestFailure::Status {
                    status: 200,
                    code: Some(code),
                    message: xml_text(&text, "Message").unwrap_or_default(),
                },
            ));
        }
        Ok(())
    }

    fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let url = AbortMultipartUpload::new(&bucket, Some(&self.credentials), key, upload_id)
            .sign(SIGN_DURATION);

        self.send(&path, |http| http.delete(url.clone()))?;
        Ok(())
    }

    fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        let path = format!("s3://{bucket}/{prefix}");
        let bucket = self.bucket(bucket)?;
        let mut action = ListObjectsV2::new(&bucket, Some(&self.credentials));
        let query = action.query_mut();
        query.insert("prefix", prefix.to_string());
        query.insert("max-keys", max_keys.to_string());
        if let Some(delimiter) = delimiter {
            query.insert("delimiter", delimiter.to_string());
        }
        if let Some(token) = continuation_token {
            query.insert("continuation-token", token.to_string());
        }
        let url = action.sign(SIGN_DURATION);

        let (_status, _headers, body) = self.send(&path, |http| http.get(url.clone()))?;
        let text = String::from_utf8_lossy(&body);
        let parsed = ListObjectsV2::parse_response(&text).map_err(|err| {
            Error::unknown(path.clone(), anyhow::anyhow!("bad list response: {err}"))
        })?;

        Ok(ListPage {
            contents: parsed
                .contents
                .into_iter()
                .map(|content| ObjectEntry {
                    key: content.key,
                    size: content.size,
                    mtime: parse_iso_mtime(&content.last_modified),
                    etag: Some(normalize_etag(&content.etag)),
                })
                .collect(),
            common_prefixes: parsed
                .common_prefixes
                .into_iter()
                .map(|common| common.prefix)
                .collect(),
            next_token: parsed.next_continuation_token,
        })
    }

    fn list_buckets(&self) -> Result<Vec<String>> {
        let path = format!("s3://, endpoint: {}", self.profile.endpoint);
        let url = self.presign_list_buckets();
        let (_status, _headers, body) = self.send(&path, |http| http.get(url.clone()))?;
        let text = String::from_utf8_lossy(&body);

        // scrape every <Name> inside <Buckets>
        let mut names = Vec::new();
        let mut rest = text.as_ref();
        while let Some(start) = rest.find("<Name>") {
            let tail = &rest[start + 6..];
            match tail.find("</Name>") {
                Some(end) => {
                    names.push(tail[..end].to_string());
                    rest = &tail[end..];
                }
                None => break,
            }
        }
        Ok(names)
    }

    fn download_to(&self, bucket: &str, key: &str, writer: &mut dyn Write) -> Result<u64> {
        let path = self.path(bucket, key);
        let bucket = self.bucket(bucket)?;
        let url = GetObject::new(&bucket, Some(&self.credentials), key).sign(SIGN_DURATION);

        retry::execute(self.max_retries, s3_should_retry, || {
            block_on(async {
                let response = self
                    .http
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|err| self.raw(&path, err.into()))?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.bytes().await.unwrap_or_default();
                    let text = String::from_utf8_lossy(&body);
                    return Err(self.raw(
                        &path,
                        RequestFailure::Status {
                            status: status.as_u16(),
                            code: xml_text(&text, "Code"),
                            message: xml_text(&text, "Message")
                                .unwrap_or_else(|| text.into_owned()),
                        },
                    ));
                }
                let mut response = response;
                let mut total = 0u64;
                while let Some(chunk) = response
                    .chunk()
                    .await
                    .map_err(|err| self.raw(&path, err.into()))?
                {
                    writer
                        .write_all(&chunk)
                        .map_err(|err| crate::error::translate_fs_error(err, path.clone()))?;
                    total += chunk.len() as u64;
                }
                Ok(total)
            })
        })
    }
}

/// Memoized client lookup keyed by profile and, in `thread_local` mode, the
/// calling thread.
pub fn get_s3_client(profile: Option<&str>) -> Result<Arc<dyn ObjectClient>> {
    type Key = (Option<String>, Option<ThreadId>);
    static CLIENTS: OnceLock<ConcurrentMap<Key, Arc<dyn ObjectClient>>> = OnceLock::new();

    let clients = CLIENTS.get_or_init(ConcurrentMap::new);
    let key: Key = match config().s3_client_cache_mode {
        ClientCacheMode::ThreadLocal => (
            profile.map(str::to_string),
            Some(thread::current().id()),
        ),
        ClientCacheMode::ProcessLocal => (profile.map(str::to_string), None),
    };

    if let Some(client) = clients.read(&key, |_, client| client.clone()) {
        return Ok(client);
    }
    let client: Arc<dyn ObjectClient> = Arc::new(S3Client::from_env(profile)?);
    let _ = clients.insert(key, client.clone());
    Ok(client)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_translation_covers_the_taxonomy() {
        let not_found = translate_s3_failure(
            RequestFailure::Status {
                status: 404,
                code: Some("NoSuchKey".to_string()),
                message: String::new(),
            },
            "s3://b/k",
            "https://s3.example.com",
        );
        assert!(matches!(not_found, Error::NotFound { .. }));

        let bucket = translate_s3_failure(
            RequestFailure::Status {
                status: 404,
                code: Some("NoSuchBucket".to_string()),
                message: String::new(),
            },
            "s3://b/k",
            "https://s3.example.com",
        );
        assert!(matches!(bucket, Error::BucketNotFound { .. }));

        let denied = translate_s3_failure(
            RequestFailure::Status {
                status: 403,
                code: Some("AccessDenied".to_string()),
                message: "nope".to_string(),
            },
            "s3://b/k",
            "https://s3.example.com",
        );
        assert!(matches!(denied, Error::PermissionDenied { .. }));

        let config_err = translate_s3_failure(
            RequestFailure::Status {
                status: 400,
                code: Some("InvalidAccessKeyId".to_string()),
                message: String::new(),
            },
            "s3://b/k",
            "https://s3.example.com",
        );
        assert!(matches!(config_err, Error::Misconfigured { .. }));
    }

    #[test]
    fn only_transient_failures_retry() {
        let server_error = translate_s3_failure(
            RequestFailure::Status {
                status: 500,
                code: Some("InternalError".to_string()),
                message: String::new(),
            },
            "s3://b/k",
            "e",
        );
        assert!(s3_should_retry(&server_error));

        assert!(!s3_should_retry(&Error::not_found("s3://b/k")));
        assert!(!s3_should_retry(&Error::unknown(
            "s3://b/k",
            anyhow::anyhow!("not a request failure")
        )));
    }

    #[test]
    fn error_code_extraction() {
        let body = r#"<?xml version="1.0"?><Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"#;
        assert_eq!(xml_text(body, "Code").as_deref(), Some("NoSuchKey"));
        assert_eq!(
            xml_text(body, "Message").as_deref(),
            Some("The specified key does not exist.")
        );
        assert_eq!(xml_text(body, "Missing"), None);
    }
}
