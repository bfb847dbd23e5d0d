//! Append-only writer that turns a byte stream into S3 multipart uploads
//! with bounded memory and concurrent part uploads.
use super::pool::{block_on, TaskPool};
use crate::{
    client::{CompletedPart, ObjectClient},
    config::config,
    Error, Result,
};
use bytes::Bytes;
use futures::future::select_all;
use std::{cmp::min, collections::BTreeMap, sync::Arc};
use tokio::task::JoinHandle;

/// Parts below this size may only appear as the last part of an upload.
pub const MIN_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Object-store hard limit on the number of parts in one upload.
const MAX_PART_COUNT: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub block_size: u64,
    pub block_autoscale: Option<bool>,
    pub max_buffer_size: u64,
    pub max_workers: Option<usize>,
    /// Stage to a shadow key and swap on a successful close.
    pub atomic: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        let config = config();
        WriterOptions {
            block_size: config.writer_block_size,
            block_autoscale: None,
            max_buffer_size: config.writer_max_buffer_size,
            max_workers: None,
            atomic: false,
        }
    }
}

struct PartDone {
    part_number: u16,
    etag: String,
    size: u64,
}

/// Upload-session state shared by the buffered and limited-seekable writers:
/// lazy upload id, in-flight part futures, back-pressure accounting and the
/// completed-part map.
pub(super) struct MultipartCore {
    pub(super) client: Arc<dyn ObjectClient>,
    pub(super) bucket: String,
    /// Key parts are uploaded under; differs from the destination key in
    /// atomic mode.
    pub(super) key: String,
    pub(super) name: String,
    pub(super) pool: TaskPool,
    pub(super) upload_id: Option<String>,
    in_flight: Vec<JoinHandle<Result<PartDone>>>,
    outstanding: u64,
    parts: BTreeMap<u16, String>,
    max_buffer_size: u64,
}

impl MultipartCore {
    pub(super) fn new(
        client: Arc<dyn ObjectClient>,
        bucket: String,
        key: String,
        name: String,
        max_buffer_size: u64,
        max_workers: Option<usize>,
    ) -> Self {
        MultipartCore {
            client,
            bucket,
            key,
            name,
            pool: TaskPool::from_max_workers(max_workers),
            upload_id: None,
            in_flight: Vec::new(),
            outstanding: 0,
            parts: BTreeMap::new(),
            max_buffer_size,
        }
    }

    pub(super) fn upload_id(&mut self) -> Result<String> {
        if self.upload_id.is_none() {
            let upload_id = self
                .client
                .create_multipart_upload(&self.bucket, &self.key)?;
            self.upload_id = Some(upload_id);
        }
        Ok(self.upload_id.clone().unwrap_or_default())
    }

    /// Submit one part upload; blocks when the outstanding bytes exceed the
    /// buffer cap until at least one in-flight part completes.
    pub(super) fn submit_part(&mut self, part_number: u16, content: Bytes) -> Result<()> {
        let upload_id = self.upload_id()?;
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let size = content.len() as u64;

        let handle = self.pool.spawn_blocking(move || {
            let etag = client.upload_part(&bucket, &key, &upload_id, part_number, content)?;
            Ok(PartDone {
                part_number,
                etag,
                size,
            })
        });
        self.in_flight.push(handle);
        self.outstanding += size;

        while !self.in_flight.is_empty() && self.outstanding >= self.max_buffer_size {
            self.wait_one()?;
        }
        Ok(())
    }

    fn wait_one(&mut self) -> Result<()> {
        let handles = std::mem::take(&mut self.in_flight);
        let (result, _index, rest) = block_on(select_all(handles));
        self.in_flight = rest;

        let done = match result {
            Ok(done) => done?,
            Err(join_err) => return Err(Error::unknown(self.name.clone(), anyhow::anyhow!(join_err))),
        };
        self.outstanding -= done.size;
        self.parts.insert(done.part_number, done.etag);
        Ok(())
    }

    pub(super) fn drain(&mut self) -> Result<()> {
        while !self.in_flight.is_empty() {
            self.wait_one()?;
        }
        Ok(())
    }

    pub(super) fn complete(&mut self) -> Result<()> {
        self.drain()?;
        let upload_id = match &self.upload_id {
            Some(upload_id) => upload_id.clone(),
            None => {
                return Err(Error::invalid_state(self.name.clone()));
            }
        };
        let parts: Vec<CompletedPart> = self
            .parts
            .iter()
            .map(|(&part_number, etag)| CompletedPart {
                part_number,
                etag: etag.clone(),
            })
            .collect();
        self.client
            .complete_multipart_upload(&self.bucket, &self.key, &upload_id, &parts)
    }

    /// Cancel in-flight parts and release the server-side upload.
    pub(super) fn abort(&mut self) {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
        self.outstanding = 0;
        if let Some(upload_id) = self.upload_id.take() {
            if let Err(err) =
                self.client
                    .abort_multipart_upload(&self.bucket, &self.key, &upload_id)
            {
                tracing::warn!("failed to abort multipart upload of {}: {err}", self.name);
            }
        }
    }
}

/// Streaming multipart writer. Append-only; see [`LimitedSeekableWriter`]
/// for the head-patching variant.
///
/// [`LimitedSeekableWriter`]: super::LimitedSeekableWriter
pub struct BufferedWriter {
    core: MultipartCore,
    buffer: Vec<u8>,
    base_block_size: u64,
    autoscale: bool,
    part_number: u16,
    offset: u64,
    // destination key when staging through a shadow key
    final_key: Option<String>,
    closed: bool,
}

impl BufferedWriter {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        name: impl Into<String>,
        options: WriterOptions,
    ) -> Result<BufferedWriter> {
        if options.block_size == 0 {
            return Err(Error::InvalidArgument {
                detail: "block_size must be bigger than 0".to_string(),
            });
        }
        let bucket = bucket.into();
        let key = key.into();
        let name = name.into();

        let (upload_key, final_key) = if options.atomic {
            let mut suffix = [0u8; 8];
            getrandom::getrandom(&mut suffix)
                .map_err(|err| Error::unknown(name.clone(), anyhow::anyhow!("getrandom: {err}")))?;
            (format!("{key}.{}.tmp", hex::encode(suffix)), Some(key))
        } else {
            (key, None)
        };

        let writer = BufferedWriter {
            core: MultipartCore::new(
                client,
                bucket,
                upload_key,
                name,
                options.max_buffer_size,
                options.max_workers,
            ),
            buffer: Vec::new(),
            base_block_size: options.block_size,
            autoscale: options
                .block_autoscale
                .unwrap_or(config().writer_block_autoscale),
            part_number: 0,
            offset: 0,
            final_key,
            closed: false,
        };
        tracing::debug!("open file: {}, mode: wb", writer.core.name);
        Ok(writer)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(self.core.name.clone()));
        }
        Ok(())
    }

    /// Effective part size, grown with the part counter so large streams
    /// stay inside the 10 000-part limit.
    fn block_size(&self) -> u64 {
        if !self.autoscale {
            return self.base_block_size;
        }
        let factor = match self.part_number as u64 {
            0..=9 => 1,
            10..=99 => 2,
            100..=999 => 4,
            _ if (self.part_number as u64) < MAX_PART_COUNT => 8,
            _ => 16,
        };
        min(self.base_block_size * factor, self.core.max_buffer_size)
    }

    fn next_part_number(&mut self) -> u16 {
        self.part_number += 1;
        self.part_number
    }

    /// Carve full-size parts off the front of the buffer, keeping enough
    /// behind that the final flush can always satisfy the minimum part size.
    fn carve(&mut self) -> Result<()> {
        loop {
            let block_size = self.block_size() as usize;
            if self.buffer.len() as u64 <= block_size as u64 + MIN_PART_SIZE {
                return Ok(());
            }
            let rest = self.buffer.split_off(block_size);
            let chunk = Bytes::from(std::mem::replace(&mut self.buffer, rest));
            let part_number = self.next_part_number();
            self.core.submit_part(part_number, chunk)?;
        }
    }

    /// Flush whatever remains as the final part(s).
    fn flush_remainder(&mut self) -> Result<()> {
        self.carve()?;
        if !self.buffer.is_empty() {
            let chunk = Bytes::from(std::mem::take(&mut self.buffer));
            let part_number = self.next_part_number();
            self.core.submit_part(part_number, chunk)?;
        }
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.buffer.extend_from_slice(data);
        self.carve()?;
        self.offset += data.len() as u64;
        Ok(data.len())
    }

    pub fn tell(&self) -> u64 {
        self.offset
    }

    fn commit(&mut self) -> Result<()> {
        if self.core.upload_id.is_none() {
            // never grew past a single request
            let body = Bytes::from(std::mem::take(&mut self.buffer));
            self.core
                .client
                .put_object(&self.core.bucket, &self.core.key, body)?;
        } else {
            self.flush_remainder()?;
            self.core.complete()?;
        }

        if let Some(final_key) = &self.final_key {
            self.core.client.copy_object(
                &self.core.bucket,
                &self.core.key,
                &self.core.bucket,
                final_key,
            )?;
            self.core
                .client
                .delete_object(&self.core.bucket, &self.core.key)?;
        }
        Ok(())
    }

    /// Commit the object. On failure the server-side upload is aborted and
    /// the destination is left untouched.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        tracing::debug!("close file: {}", self.core.name);
        let result = self.commit();
        if result.is_err() {
            self.core.abort();
        }
        self.closed = true;
        self.core.pool.shutdown();
        result
    }

    /// Drop all buffered and in-flight data and release the upload.
    pub fn abort(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.buffer.clear();
        self.core.abort();
        self.closed = true;
        self.core.pool.shutdown();
        Ok(())
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!("writer dropped without close, aborting: {}", self.core.name);
            let _ = self.abort();
        }
    }
}

impl super::FileLike for BufferedWriter {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn mode(&self) -> &'static str {
        "wb"
    }

    fn writable(&self) -> bool {
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        BufferedWriter::write(self, data)
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn close(&mut self) -> Result<()> {
        BufferedWriter::close(self)
    }
}

impl std::io::Write for BufferedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        BufferedWriter::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::test::MockClient;
    use std::sync::atomic::Ordering;

    const MIB: usize = 1024 * 1024;

    fn writer(client: &Arc<MockClient>, options: WriterOptions) -> BufferedWriter {
        client.create_bucket("b");
        BufferedWriter::new(client.clone(), "b", "k", "s3://b/k", options).unwrap()
    }

    fn options(block_size: u64) -> WriterOptions {
        WriterOptions {
            block_size,
            block_autoscale: Some(false),
            max_buffer_size: 128 * MIB as u64,
            max_workers: None,
            atomic: false,
        }
    }

    #[test]
    fn small_objects_use_a_single_put() {
        let client = MockClient::shared();
        let mut writer = writer(&client, options(8 * MIB as u64));

        let body = vec![7u8; 10 * MIB];
        writer.write(&body).unwrap();
        writer.close().unwrap();

        assert_eq!(client.multipart_count.load(Ordering::SeqCst), 0);
        assert_eq!(client.put_count.load(Ordering::SeqCst), 1);
        assert_eq!(client.object_bytes("b", "k").unwrap().len(), 10 * MIB);
    }

    #[test]
    fn larger_objects_produce_min_sized_parts() {
        let client = MockClient::shared();
        let mut writer = writer(&client, options(8 * MIB as u64));

        let body = vec![3u8; 17 * MIB];
        writer.write(&body).unwrap();
        writer.close().unwrap();

        assert_eq!(client.multipart_count.load(Ordering::SeqCst), 1);
        assert_eq!(client.put_count.load(Ordering::SeqCst), 0);
        let stored = client.object_bytes("b", "k").unwrap();
        assert_eq!(stored.len(), 17 * MIB);
        assert_eq!(stored, body.as_slice());
    }

    #[test]
    fn bytes_survive_arbitrary_write_chunking() {
        let client = MockClient::shared();
        let mut writer = writer(&client, options(8 * MIB as u64));

        let body: Vec<u8> = (0..20 * MIB).map(|index| index as u8).collect();
        for chunk in body.chunks(3 * MIB + 17) {
            writer.write(chunk).unwrap();
        }
        assert_eq!(writer.tell(), body.len() as u64);
        writer.close().unwrap();

        assert_eq!(client.object_bytes("b", "k").unwrap(), body.as_slice());
    }

    #[test]
    fn empty_writer_stores_an_empty_object() {
        let client = MockClient::shared();
        let mut writer = writer(&client, options(8 * MIB as u64));
        writer.close().unwrap();

        assert_eq!(client.object_bytes("b", "k").unwrap().len(), 0);
    }

    #[test]
    fn abort_leaves_no_object_and_no_upload() {
        let client = MockClient::shared();
        let mut writer = writer(&client, options(8 * MIB as u64));

        writer.write(&vec![1u8; 20 * MIB]).unwrap();
        writer.abort().unwrap();

        assert!(client.object_bytes("b", "k").is_none());
        assert_eq!(client.pending_uploads(), 0);
        assert!(matches!(
            writer.write(b"after"),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn atomic_mode_swaps_on_close() {
        let client = MockClient::shared();
        client.create_bucket("b");
        let mut writer = BufferedWriter::new(
            client.clone(),
            "b",
            "k",
            "s3://b/k",
            WriterOptions {
                atomic: true,
                ..options(8 * MIB as u64)
            },
        )
        .unwrap();

        writer.write(b"staged").unwrap();
        assert!(client.object_bytes("b", "k").is_none());
        writer.close().unwrap();

        assert_eq!(client.object_bytes("b", "k").unwrap().as_ref(), b"staged");
        // the staging object is gone
        assert_eq!(client.object_keys("b"), vec!["k".to_string()]);
    }

    #[test]
    fn autoscale_grows_the_part_size() {
        let client = MockClient::shared();
        client.create_bucket("b");
        let mut writer = BufferedWriter::new(
            client.clone(),
            "b",
            "k",
            "s3://b/k",
            WriterOptions {
                block_size: 8 * MIB as u64,
                block_autoscale: Some(true),
                max_buffer_size: 128 * MIB as u64,
                max_workers: None,
                atomic: false,
            },
        )
        .unwrap();

        writer.part_number = 10;
        assert_eq!(writer.block_size(), 16 * MIB as u64);
        writer.part_number = 100;
        assert_eq!(writer.block_size(), 32 * MIB as u64);
        writer.part_number = 1000;
        assert_eq!(writer.block_size(), 64 * MIB as u64);
        writer.part_number = 0;
        assert_eq!(writer.block_size(), 8 * MIB as u64);
        writer.abort().unwrap();
    }
}
