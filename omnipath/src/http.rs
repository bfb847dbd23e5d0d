//! Read-only HTTP(S) backend. Servers that report a `Content-Length` are
//! read through the prefetch reader with range GETs; anything else is
//! downloaded whole.
use crate::{
    config::config,
    path::{ModeOp, OpenMode, OpenOptions, PathOps, StatResult},
    retry,
    stream::{pool::block_on, seek_target, FileLike, PrefetchReader, RangeSource, ReaderOptions, NEWLINE},
    Error, Result,
};
use bytes::Bytes;
use std::{
    cmp::min,
    io,
    sync::{Arc, OnceLock},
    time::Duration,
};

pub(crate) fn make_path(raw: String, _profile: Option<String>) -> Result<Arc<dyn PathOps>> {
    Ok(Arc::new(HttpPath::new(raw)))
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default()
    })
}

#[derive(Debug, thiserror::Error)]
enum HttpFailure {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}")]
    Status { status: u16 },
}

fn translate_http_error(failure: HttpFailure, url: &str) -> Error {
    match &failure {
        HttpFailure::Status { status } => match status {
            401 | 403 => Error::PermissionDenied {
                path: url.to_string(),
                detail: format!("http status {status}"),
            },
            404 => Error::not_found(url),
            _ => Error::unknown(url, anyhow::Error::new(failure)),
        },
        HttpFailure::Transport(_) => Error::unknown(url, anyhow::Error::new(failure)),
    }
}

fn http_should_retry(err: &Error) -> bool {
    let Error::Unknown { source, .. } = err else {
        return false;
    };
    match source.downcast_ref::<HttpFailure>() {
        Some(HttpFailure::Transport(err)) => {
            err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
        }
        Some(HttpFailure::Status { status }) => (500..=599).contains(status),
        None => false,
    }
}

struct HeadInfo {
    size: Option<u64>,
    mtime: Option<f64>,
    etag: Option<String>,
    content_type: Option<String>,
}

fn head(url: &str) -> Result<HeadInfo> {
    retry::execute(config().http_max_retry_times, http_should_retry, || {
        block_on(async {
            let response = http_client()
                .head(url)
                .send()
                .await
                .map_err(|err| translate_http_error(err.into(), url))?;
            let status = response.status();
            if !status.is_success() {
                return Err(translate_http_error(
                    HttpFailure::Status {
                        status: status.as_u16(),
                    },
                    url,
                ));
            }
            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            };
            Ok(HeadInfo {
                size: header("content-length").and_then(|value| value.parse().ok()),
                mtime: header("last-modified").and_then(|value| {
                    chrono::DateTime::parse_from_rfc2822(&value)
                        .ok()
                        .map(|parsed| parsed.timestamp() as f64)
                }),
                etag: header("etag"),
                content_type: header("content-type"),
            })
        })
    })
}

fn fetch(url: &str, range: Option<(u64, u64)>) -> Result<(Bytes, Option<String>)> {
    retry::execute(config().http_max_retry_times, http_should_retry, || {
        block_on(async {
            let mut request = http_client().get(url);
            if let Some((start, end)) = range {
                request = request.header(reqwest::header::RANGE, format!("bytes={start}-{end}"));
            }
            let response = request
                .send()
                .await
                .map_err(|err| translate_http_error(err.into(), url))?;
            let status = response.status();
            if !status.is_success() {
                return Err(translate_http_error(
                    HttpFailure::Status {
                        status: status.as_u16(),
                    },
                    url,
                ));
            }
            let etag = response
                .headers()
                .get("etag")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let whole = status != reqwest::StatusCode::PARTIAL_CONTENT;
            let body = response
                .bytes()
                .await
                .map_err(|err| translate_http_error(err.into(), url))?;
            // some servers ignore Range and return the full body
            let body = match (range, whole) {
                (Some((start, end)), true) => {
                    let start = min(start as usize, body.len());
                    let end = min(end as usize + 1, body.len());
                    body.slice(start..end)
                }
                _ => body,
            };
            Ok((body, etag))
        })
    })
}

pub struct HttpPath {
    raw: String,
}

impl HttpPath {
    pub fn new(url: impl Into<String>) -> HttpPath {
        HttpPath { raw: url.into() }
    }
}

impl PathOps for HttpPath {
    fn protocol(&self) -> &'static str {
        "http"
    }

    fn as_str(&self) -> &str {
        &self.raw
    }

    fn stat(&self, _follow_symlinks: bool) -> Result<StatResult> {
        let info = head(&self.raw)?;
        let mut stat = StatResult {
            size: info.size.unwrap_or(0),
            mtime: info.mtime.unwrap_or(0.0),
            ctime: info.mtime.unwrap_or(0.0),
            is_dir: false,
            is_link: false,
            extra: Default::default(),
        };
        if let Some(etag) = info.etag {
            stat.extra.insert("etag".to_string(), etag);
        }
        if let Some(content_type) = info.content_type {
            stat.extra.insert("content-type".to_string(), content_type);
        }
        Ok(stat)
    }

    fn exists(&self, _followlinks: bool) -> Result<bool> {
        match head(&self.raw) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn is_dir(&self) -> Result<bool> {
        Ok(false)
    }

    fn is_file(&self) -> Result<bool> {
        self.exists(false)
    }

    fn open(&self, mode: &OpenMode, options: &OpenOptions) -> Result<Box<dyn FileLike>> {
        if mode.op != ModeOp::Read || mode.update {
            return Err(Error::unsupported(self.raw.clone(), "write"));
        }

        let info = head(&self.raw)?;
        match info.size {
            Some(size) => {
                let source = Arc::new(HttpRangeSource {
                    url: self.raw.clone(),
                    size,
                    etag: info.etag,
                });
                let reader_options = ReaderOptions {
                    block_size: options.block_size.unwrap_or(config().reader_block_size),
                    max_buffer_size: options
                        .max_buffer_size
                        .unwrap_or(config().reader_max_buffer_size),
                    block_forward: options.block_forward,
                    max_workers: options.max_workers,
                };
                Ok(Box::new(PrefetchReader::new(source, reader_options)?))
            }
            None => {
                // no content length: fall back to one whole-body download
                let (body, _etag) = fetch(&self.raw, None)?;
                Ok(Box::new(BodyReader {
                    name: self.raw.clone(),
                    body,
                    position: 0,
                    closed: false,
                }))
            }
        }
    }
}

/// Range source over one HTTP object, pinned to the ETag observed at open.
struct HttpRangeSource {
    url: String,
    size: u64,
    etag: Option<String>,
}

impl RangeSource for HttpRangeSource {
    fn name(&self) -> &str {
        &self.url
    }

    fn content_size(&self) -> u64 {
        self.size
    }

    fn fetch(&self, start: u64, end: u64) -> Result<Bytes> {
        let (body, etag) = fetch(&self.url, Some((start, end)))?;
        if let (Some(before), Some(after)) = (&self.etag, &etag) {
            if before != after {
                return Err(Error::ObjectChanged {
                    path: self.url.clone(),
                    before: before.clone(),
                    after: after.clone(),
                });
            }
        }
        Ok(body)
    }
}

/// Seekable reader over an already-downloaded body.
struct BodyReader {
    name: String,
    body: Bytes,
    position: usize,
    closed: bool,
}

impl BodyReader {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(self.name.clone()));
        }
        Ok(())
    }
}

impl FileLike for BodyReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> &'static str {
        "rb"
    }

    fn readable(&self) -> bool {
        true
    }

    fn seekable(&self) -> bool {
        true
    }

    fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let available = self.body.len().saturating_sub(self.position);
        let count = size.map_or(available, |size| min(size, available));
        let out = self.body[self.position..self.position + count].to_vec();
        self.position += count;
        Ok(out)
    }

    fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let available = self.body.len().saturating_sub(self.position);
        let limit = size.map_or(available, |size| min(size, available));
        let window = &self.body[self.position..self.position + limit];
        let count = match window.iter().position(|&byte| byte == NEWLINE) {
            Some(at) => at + 1,
            None => window.len(),
        };
        let out = window[..count].to_vec();
        self.position += count;
        Ok(out)
    }

    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = FileLike::read(self, Some(buf.len()))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        let target = seek_target(pos, self.position as u64, self.body.len() as u64);
        self.position = target.clamp(0, self.body.len() as i64) as usize;
        Ok(self.position as u64)
    }

    fn tell(&self) -> u64 {
        self.position as u64
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.body.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_translation() {
        let err = translate_http_error(HttpFailure::Status { status: 404 }, "http://x/y");
        assert!(matches!(err, Error::NotFound { .. }));

        let err = translate_http_error(HttpFailure::Status { status: 403 }, "http://x/y");
        assert!(matches!(err, Error::PermissionDenied { .. }));

        let err = translate_http_error(HttpFailure::Status { status: 503 }, "http://x/y");
        assert!(http_should_retry(&err));

        let err = translate_http_error(HttpFailure::Status { status: 418 }, "http://x/y");
        assert!(!http_should_retry(&err));
    }

    #[test]
    fn body_reader_random_access() {
        let mut reader = BodyReader {
            name: "http://x/y".to_string(),
            body: Bytes::from_static(b"alpha\nbeta"),
            position: 0,
            closed: false,
        };
        assert_eq!(reader.readline(None).unwrap(), b"alpha\n");
        assert_eq!(FileLike::read(&mut reader, None).unwrap(), b"beta");
        FileLike::seek(&mut reader, io::SeekFrom::Start(0)).unwrap();
        assert_eq!(FileLike::read(&mut reader, Some(5)).unwrap(), b"alpha");
        reader.close().unwrap();
        assert!(FileLike::read(&mut reader, None).is_err());
    }
}
