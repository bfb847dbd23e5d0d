//! The object-store client surface the streaming engine is written against.
//!
//! `S3Client` implements it over the S3 REST v4 wire; the in-memory
//! [`test::MockClient`] implements it for tests and for embedders that want
//! to exercise the engine without a server.
use crate::Result;
use bytes::Bytes;
use std::{
    collections::HashMap,
    io::{self, Read, Write},
};

#[derive(Debug, Clone, Default)]
pub struct HeadResult {
    pub size: u64,
    pub mtime: Option<f64>,
    pub etag: Option<String>,
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub mtime: Option<f64>,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub contents: Vec<ObjectEntry>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u16,
    pub etag: String,
}

/// Chunk size used when shuttling whole objects through `download_to` /
/// `upload_from`.
pub(crate) const TRANSFER_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Synchronous client surface over the S3 REST operations the engine needs.
///
/// Errors returned by implementations are already translated to the neutral
/// taxonomy, with transient failures retried internally.
pub trait ObjectClient: Send + Sync {
    /// Endpoint description for error messages.
    fn endpoint(&self) -> String;

    fn head_object(&self, bucket: &str, key: &str) -> Result<HeadResult>;

    /// `range` is an inclusive byte range. Returns the body and the ETag the
    /// server reported for it.
    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<(Bytes, Option<String>)>;

    fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()>;

    fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String>;

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> Result<String>;

    /// Server-side part copy; `range` is an inclusive byte range of the
    /// source object.
    #[allow(clippy::too_many_arguments)]
    fn upload_part_copy(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u16,
        src_bucket: &str,
        src_key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<String>;

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;

    fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage>;

    fn list_buckets(&self) -> Result<Vec<String>>;

    /// Stream the whole object into `writer`, returning the byte count.
    fn download_to(&self, bucket: &str, key: &str, writer: &mut dyn Write) -> Result<u64> {
        let (body, _etag) = self.get_object(bucket, key, None)?;
        writer
            .write_all(&body)
            .map_err(|err| crate::error::translate_fs_error(err, format!("s3://{bucket}/{key}")))?;
        Ok(body.len() as u64)
    }

    /// Drain `reader` into the object, multiparting when it outgrows a
    /// single put. Returns the byte count.
    fn upload_from(&self, bucket: &str, key: &str, reader: &mut dyn Read) -> Result<u64> {
        let path = format!("s3://{bucket}/{key}");
        let part_size = crate::config::config().writer_block_size.max(1) as usize;

        let mut first = Vec::with_capacity(part_size.min(TRANSFER_CHUNK_SIZE));
        read_up_to(reader, part_size, &mut first, &path)?;
        if first.len() < part_size {
            let total = first.len() as u64;
            self.put_object(bucket, key, Bytes::from(first))?;
            return Ok(total);
        }

        let upload_id = self.create_multipart_upload(bucket, key)?;
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut chunk = first;
        let result = loop {
            let part_number = (parts.len() + 1) as u16;
            total += chunk.len() as u64;
            let body = Bytes::from(std::mem::take(&mut chunk));
            match self.upload_part(bucket, key, &upload_id, part_number, body) {
                Ok(etag) => parts.push(CompletedPart { part_number, etag }),
                Err(err) => break Err(err),
            }
            if let Err(err) = read_up_to(reader, part_size, &mut chunk, &path) {
                break Err(err);
            }
            if chunk.is_empty() {
                break self.complete_multipart_upload(bucket, key, &upload_id, &parts);
            }
        };
        if result.is_err() {
            let _ = self.abort_multipart_upload(bucket, key, &upload_id);
        }
        result.map(|_| total)
    }
}

fn read_up_to(
    reader: &mut dyn Read,
    limit: usize,
    buf: &mut Vec<u8>,
    path: &str,
) -> Result<()> {
    buf.clear();
    let mut taken = reader.take(limit as u64);
    taken
        .read_to_end(buf)
        .map_err(|err| crate::error::translate_fs_error(err, path))?;
    Ok(())
}

#[cfg(any(test, feature = "test"))]
pub mod test {
    use super::*;
    use crate::Error;
    use md5::{Digest, Md5};
    use parking_lot::Mutex;
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{SystemTime, UNIX_EPOCH},
    };

    #[derive(Clone)]
    struct MockObject {
        data: Bytes,
        mtime: f64,
        etag: String,
    }

    struct MockUpload {
        bucket: String,
        key: String,
        parts: BTreeMap<u16, Bytes>,
    }

    #[derive(Default)]
    struct MockState {
        buckets: BTreeMap<String, BTreeMap<String, MockObject>>,
        uploads: HashMap<String, MockUpload>,
        next_upload_id: u64,
    }

    /// In-memory object store implementing the full client surface.
    #[derive(Default)]
    pub struct MockClient {
        state: Mutex<MockState>,
        pub put_count: AtomicUsize,
        pub multipart_count: AtomicUsize,
        pub abort_count: AtomicUsize,
    }

    fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn etag_of(data: &[u8]) -> String {
        format!("\"{}\"", hex::encode(Md5::digest(data)))
    }

    impl MockObject {
        fn new(data: Bytes) -> Self {
            let etag = etag_of(&data);
            MockObject {
                data,
                mtime: now(),
                etag,
            }
        }
    }

    impl MockClient {
        pub fn new() -> Self {
            MockClient::default()
        }

        pub fn shared() -> Arc<Self> {
            Arc::new(MockClient::default())
        }

        pub fn with_buckets(names: &[&str]) -> Arc<Self> {
            let client = MockClient::default();
            {
                let mut state = client.state.lock();
                for name in names {
                    state.buckets.entry(name.to_string()).or_default();
                }
            }
            Arc::new(client)
        }

        pub fn create_bucket(&self, bucket: &str) {
            self.state.lock().buckets.entry(bucket.to_string()).or_default();
        }

        pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
            let mut state = self.state.lock();
            state
                .buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(key.to_string(), MockObject::new(data.into()));
        }

        pub fn object_bytes(&self, bucket: &str, key: &str) -> Option<Bytes> {
            let state = self.state.lock();
            state
                .buckets
                .get(bucket)
                .and_then(|objects| objects.get(key))
                .map(|object| object.data.clone())
        }

        pub fn object_keys(&self, bucket: &str) -> Vec<String> {
            let state = self.state.lock();
            state
                .buckets
                .get(bucket)
                .map(|objects| objects.keys().cloned().collect())
                .unwrap_or_default()
        }

        pub fn pending_uploads(&self) -> usize {
            self.state.lock().uploads.len()
        }

        fn path(bucket: &str, key: &str) -> String {
            format!("s3://{bucket}/{key}")
        }
    }

    impl ObjectClient for MockClient {
        fn endpoint(&self) -> String {
            "mock://".to_string()
        }

        fn head_object(&self, bucket: &str, key: &str) -> Result<HeadResult> {
            let state = self.state.lock();
            let objects = state
                .buckets
                .get(bucket)
                .ok_or_else(|| Error::BucketNotFound {
                    path: Self::path(bucket, key),
                })?;
            let object = objects.get(key).ok_or_else(|| Error::NotFound {
                path: Self::path(bucket, key),
            })?;
            Ok(HeadResult {
                size: object.data.len() as u64,
                mtime: Some(object.mtime),
                etag: Some(object.etag.clone()),
                extra: HashMap::new(),
            })
        }

        fn get_object(
            &self,
            bucket: &str,
            key: &str,
            range: Option<(u64, u64)>,
        ) -> Result<(Bytes, Option<String>)> {
            let state = self.state.lock();
            let object = state
                .buckets
                .get(bucket)
                .ok_or_else(|| Error::BucketNotFound {
                    path: Self::path(bucket, key),
                })?
                .get(key)
                .ok_or_else(|| Error::NotFound {
                    path: Self::path(bucket, key),
                })?;
            let data = match range {
                Some((start, end)) => {
                    let start = start as usize;
                    if start >= object.data.len() {
                        return Err(Error::InvalidArgument {
                            detail: format!("range out of bounds: bytes={start}-{end}"),
                        });
                    }
                    let end = (end as usize + 1).min(object.data.len());
                    object.data.slice(start..end)
                }
                None => object.data.clone(),
            };
            Ok((data, Some(object.etag.clone())))
        }

        fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
            self.put_count.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock();
            if !state.buckets.contains_key(bucket) {
                return Err(Error::BucketNotFound {
                    path: Self::path(bucket, key),
                });
            }
            state
                .buckets
                .get_mut(bucket)
                .expect("checked above")
                .insert(key.to_string(), MockObject::new(body));
            Ok(())
        }

        fn copy_object(
            &self,
            src_bucket: &str,
            src_key: &str,
            dst_bucket: &str,
            dst_key: &str,
        ) -> Result<()> {
            let mut state = self.state.lock();
            let object = state
                .buckets
                .get(src_bucket)
                .and_then(|objects| objects.get(src_key))
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    path: Self::path(src_bucket, src_key),
                })?;
            state
                .buckets
                .get_mut(dst_bucket)
                .ok_or_else(|| Error::BucketNotFound {
                    path: Self::path(dst_bucket, dst_key),
                })?
                .insert(dst_key.to_string(), MockObject::new(object.data));
            Ok(())
        }

        fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
            let mut state = self.state.lock();
            if let Some(objects) = state.buckets.get_mut(bucket) {
                objects.remove(key);
            }
            Ok(())
        }

        fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
            self.multipart_count.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock();
            if !state.buckets.contains_key(bucket) {
                return Err(Error::BucketNotFound {
                    path: Self::path(bucket, key),
                });
            }
            state.next_upload_id += 1;
            let upload_id = format!("upload-{}", state.next_upload_id);
            state.uploads.insert(
                upload_id.clone(),
                MockUpload {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        }

        fn upload_part(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            part_number: u16,
            body: Bytes,
        ) -> Result<String> {
            let mut state = self.state.lock();
            let etag = etag_of(&body);
            let upload = state
                .uploads
                .get_mut(upload_id)
                .ok_or_else(|| Error::NotFound {
                    path: Self::path(bucket, key),
                })?;
            upload.parts.insert(part_number, body);
            Ok(etag)
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
            let (body, _etag) = self.get_object(src_bucket, src_key, range)?;
            self.upload_part(bucket, key, upload_id, part_number, body)
        }

        fn complete_multipart_upload(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            parts: &[CompletedPart],
        ) -> Result<()> {
            let mut state = self.state.lock();
            let upload = state
                .uploads
                .remove(upload_id)
                .ok_or_else(|| Error::NotFound {
                    path: Self::path(bucket, key),
                })?;
            debug_assert_eq!(upload.bucket, bucket);
            debug_assert_eq!(upload.key, key);

            // part numbers must be dense from 1 and every part present
            let mut assembled = Vec::new();
            for (index, part) in parts.iter().enumerate() {
                if part.part_number as usize != index + 1 {
                    return Err(Error::InvalidArgument {
                        detail: format!("part numbers are not dense: {}", part.part_number),
                    });
                }
                let body = upload.parts.get(&part.part_number).ok_or_else(|| {
                    Error::InvalidArgument {
                        detail: format!("no such part: {}", part.part_number),
                    }
                })?;
                assembled.extend_from_slice(body);
            }
            state
                .buckets
                .get_mut(bucket)
                .ok_or_else(|| Error::BucketNotFound {
                    path: Self::path(bucket, key),
                })?
                .insert(key.to_string(), MockObject::new(Bytes::from(assembled)));
            Ok(())
        }

        fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
            self.abort_count.fetch_add(1, Ordering::SeqCst);
            let _ = (bucket, key);
            self.state.lock().uploads.remove(upload_id);
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
            let state = self.state.lock();
            let objects = state
                .buckets
                .get(bucket)
                .ok_or_else(|| Error::BucketNotFound {
                    path: format!("s3://{bucket}/"),
                })?;

            let mut page = ListPage::default();
            let mut seen_prefixes = std::collections::BTreeSet::new();
            let mut emitted = 0usize;
            for (key, object) in objects.range(prefix.to_string()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                if let Some(token) = continuation_token {
                    if key.as_str() <= token {
                        continue;
                    }
                }
                if emitted >= max_keys {
                    page.next_token = page
                        .contents
                        .last()
                        .map(|entry| entry.key.clone())
                        .or_else(|| page.common_prefixes.last().cloned());
                    break;
                }
                if let Some(delimiter) = delimiter.filter(|d| !d.is_empty()) {
                    if let Some(at) = key[prefix.len()..].find(delimiter) {
                        let common = &key[..prefix.len() + at + delimiter.len()];
                        if seen_prefixes.insert(common.to_string()) {
                            page.common_prefixes.push(common.to_string());
                            emitted += 1;
                        }
                        continue;
                    }
                }
                page.contents.push(ObjectEntry {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    mtime: Some(object.mtime),
                    etag: Some(object.etag.clone()),
                });
                emitted += 1;
            }
            Ok(page)
        }

        fn list_buckets(&self) -> Result<Vec<String>> {
            Ok(self.state.lock().buckets.keys().cloned().collect())
        }
    }

    #[test]
    fn delimiter_listing_groups_prefixes() {
        let client = MockClient::new();
        client.create_bucket("b");
        client.insert_object("b", "a/1", "x");
        client.insert_object("b", "a/2", "x");
        client.insert_object("b", "b/1", "x");
        client.insert_object("b", "top", "x");

        let page = client.list_objects_v2("b", "", Some("/"), None, 1000).unwrap();
        assert_eq!(page.common_prefixes, vec!["a/", "b/"]);
        assert_eq!(page.contents.len(), 1);
        assert_eq!(page.contents[0].key, "top");
    }

    #[test]
    fn pagination_resumes_after_the_token() {
        let client = MockClient::new();
        client.create_bucket("b");
        for index in 0..5 {
            client.insert_object("b", &format!("k{index}"), "x");
        }

        let first = client.list_objects_v2("b", "", None, None, 2).unwrap();
        assert_eq!(first.contents.len(), 2);
        let token = first.next_token.clone().unwrap();

        let second = client
            .list_objects_v2("b", "", None, Some(&token), 100)
            .unwrap();
        assert_eq!(second.contents.len(), 3);
        assert!(second.next_token.is_none());
    }

    #[test]
    fn upload_from_small_bodies_use_a_single_put() {
        let client = MockClient::new();
        client.create_bucket("b");

        let mut body = io::Cursor::new(b"tiny".to_vec());
        client.upload_from("b", "k", &mut body).unwrap();
        assert_eq!(client.object_bytes("b", "k").unwrap().as_ref(), b"tiny");
        assert_eq!(client.multipart_count.load(Ordering::SeqCst), 0);
    }
}
