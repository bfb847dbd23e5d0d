//! Multipart writer for container formats that patch a fixed-size header
//! after the body is written.
//!
//! The first `head_block_size` bytes stay in memory for the life of the
//! stream and go out as part 1 on close; the last `tail_block_size` bytes
//! stay seekable in the tail buffer. Seeks anywhere else fail.
use super::{
    seek_target,
    writer::{MultipartCore, MIN_PART_SIZE},
    FileLike,
};
use crate::{client::ObjectClient, config::config, Error, Result};
use bytes::Bytes;
use std::{io, sync::Arc};

#[derive(Debug, Clone)]
pub struct SeekableWriterOptions {
    pub block_size: u64,
    pub head_block_size: Option<u64>,
    pub tail_block_size: Option<u64>,
    pub max_buffer_size: u64,
    pub max_workers: Option<usize>,
}

impl Default for SeekableWriterOptions {
    fn default() -> Self {
        SeekableWriterOptions {
            block_size: MIN_PART_SIZE,
            head_block_size: None,
            tail_block_size: None,
            max_buffer_size: config().writer_max_buffer_size,
            max_workers: None,
        }
    }
}

pub struct LimitedSeekableWriter {
    core: MultipartCore,
    block_size: u64,
    head_block_size: u64,
    tail_block_size: u64,

    head: Vec<u8>,
    head_pos: usize,
    tail: Vec<u8>,
    tail_pos: usize,

    part_number: u16,
    offset: u64,
    content_size: u64,
    closed: bool,
}

/// Overwrite-or-extend at a position, zero-filling any gap.
fn write_at(buffer: &mut Vec<u8>, pos: usize, data: &[u8]) {
    let end = pos + data.len();
    if buffer.len() < end {
        buffer.resize(end, 0);
    }
    buffer[pos..end].copy_from_slice(data);
}

impl LimitedSeekableWriter {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        name: impl Into<String>,
        options: SeekableWriterOptions,
    ) -> Result<LimitedSeekableWriter> {
        if options.block_size == 0 {
            return Err(Error::InvalidArgument {
                detail: "block_size must be bigger than 0".to_string(),
            });
        }
        let writer = LimitedSeekableWriter {
            core: MultipartCore::new(
                client,
                bucket.into(),
                key.into(),
                name.into(),
                options.max_buffer_size,
                options.max_workers,
            ),
            block_size: options.block_size,
            head_block_size: options.head_block_size.unwrap_or(options.block_size),
            tail_block_size: options.tail_block_size.unwrap_or(options.block_size),
            head: Vec::new(),
            head_pos: 0,
            tail: Vec::new(),
            tail_pos: 0,
            part_number: 0,
            offset: 0,
            content_size: 0,
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

    /// First byte offset still held in the tail buffer.
    fn tail_offset(&self) -> u64 {
        self.content_size - self.tail.len() as u64
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;

        if self.head.len() as u64 != self.head_block_size {
            // still filling the head, no tail exists yet
            self.write_to_head(data)?;
        } else if self.offset < self.head_block_size {
            self.write_to_head_after_tail(data)?;
        } else if self.offset >= self.tail_offset() {
            self.write_to_tail(data)?;
        } else {
            return Err(Error::InvalidSeek {
                path: self.core.name.clone(),
                offset: self.offset as i64,
            });
        }
        Ok(data.len())
    }

    fn write_to_head(&mut self, data: &[u8]) -> Result<()> {
        if self.offset + data.len() as u64 <= self.head_block_size {
            write_at(&mut self.head, self.head_pos, data);
            self.head_pos += data.len();
            self.offset = self.head.len() as u64;
            self.content_size = self.offset;
            if self.content_size == self.head_block_size {
                // reserve part 1 for the head
                self.part_number += 1;
            }
            Ok(())
        } else {
            let split = (self.head_block_size - self.offset) as usize;
            write_at(&mut self.head, self.head_pos, &data[..split]);
            self.head_pos += split;
            self.offset = self.head.len() as u64;
            self.content_size = self.offset;
            self.part_number += 1;
            self.write_to_tail(&data[split..])
        }
    }

    fn write_to_head_after_tail(&mut self, data: &[u8]) -> Result<()> {
        if self.offset + data.len() as u64 > self.head_block_size {
            return Err(Error::InvalidArgument {
                detail: format!(
                    "head part overflow on {}: {} bytes left but tried to write {}",
                    self.core.name,
                    self.head_block_size - self.offset,
                    data.len()
                ),
            });
        }
        write_at(&mut self.head, self.head_pos, data);
        self.head_pos += data.len();
        self.offset += data.len() as u64;
        Ok(())
    }

    fn write_to_tail(&mut self, data: &[u8]) -> Result<()> {
        write_at(&mut self.tail, self.tail_pos, data);
        self.tail_pos += data.len();
        if self.tail_pos as u64 >= self.block_size + self.tail_block_size {
            self.submit_tail_excess()?;
        }
        self.offset += data.len() as u64;
        if self.offset > self.content_size {
            self.content_size = self.offset;
        }
        Ok(())
    }

    /// Upload everything in the tail but its last `tail_block_size` bytes.
    fn submit_tail_excess(&mut self) -> Result<()> {
        if self.tail.is_empty() {
            return Ok(());
        }
        let keep_from = self.tail.len() - self.tail_block_size as usize;
        let kept = self.tail.split_off(keep_from);
        let excess = std::mem::replace(&mut self.tail, kept);
        self.tail_pos = self.tail.len();
        self.submit_content(Bytes::from(excess))
    }

    /// Carve `content` into parts of `block_size`, giving the final part the
    /// remainder.
    fn submit_content(&mut self, mut content: Bytes) -> Result<()> {
        while content.len() as u64 > self.block_size + MIN_PART_SIZE {
            let chunk = content.split_to(self.block_size as usize);
            self.part_number += 1;
            self.core.submit_part(self.part_number, chunk)?;
        }
        if !content.is_empty() {
            self.part_number += 1;
            self.core.submit_part(self.part_number, content)?;
        }
        Ok(())
    }

    pub fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        self.ensure_open()?;

        let target = seek_target(pos, self.offset, self.content_size);
        if target < 0 {
            return Err(Error::InvalidSeek {
                path: self.core.name.clone(),
                offset: target,
            });
        }
        let target = target as u64;

        if target < self.head_block_size {
            self.head_pos = target as usize;
        } else if target >= self.tail_offset() {
            self.tail_pos = (target - self.tail_offset()) as usize;
        } else {
            return Err(Error::InvalidSeek {
                path: self.core.name.clone(),
                offset: target as i64,
            });
        }
        self.offset = target;
        Ok(self.offset)
    }

    pub fn tell(&self) -> u64 {
        self.offset
    }

    fn commit(&mut self) -> Result<()> {
        if self.core.upload_id.is_none() {
            // everything still fits in memory
            let mut body = std::mem::take(&mut self.head);
            body.append(&mut self.tail);
            return self
                .core
                .client
                .put_object(&self.core.bucket, &self.core.key, Bytes::from(body));
        }

        let head = Bytes::from(std::mem::take(&mut self.head));
        self.core.submit_part(1, head)?;
        if !self.tail.is_empty() {
            let tail = Bytes::from(std::mem::take(&mut self.tail));
            self.submit_content(tail)?;
        }
        self.core.complete()
    }

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

    pub fn abort(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.head.clear();
        self.tail.clear();
        self.core.abort();
        self.closed = true;
        self.core.pool.shutdown();
        Ok(())
    }
}

impl Drop for LimitedSeekableWriter {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!("writer dropped without close, aborting: {}", self.core.name);
            let _ = self.abort();
        }
    }
}

impl FileLike for LimitedSeekableWriter {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn mode(&self) -> &'static str {
        "wb"
    }

    fn writable(&self) -> bool {
        true
    }

    fn seekable(&self) -> bool {
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        LimitedSeekableWriter::write(self, data)
    }

    fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        LimitedSeekableWriter::seek(self, pos)
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn close(&mut self) -> Result<()> {
        LimitedSeekableWriter::close(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::test::MockClient;

    const MIB: usize = 1024 * 1024;

    fn writer(client: &Arc<MockClient>, options: SeekableWriterOptions) -> LimitedSeekableWriter {
        client.create_bucket("b");
        LimitedSeekableWriter::new(client.clone(), "b", "k", "s3://b/k", options).unwrap()
    }

    #[test]
    fn header_patch_on_a_small_object() {
        let client = MockClient::shared();
        let mut writer = writer(
            &client,
            SeekableWriterOptions {
                head_block_size: Some(64),
                ..SeekableWriterOptions::default()
            },
        );

        let body = vec![0xAAu8; MIB];
        writer.write(&body).unwrap();

        writer.seek(io::SeekFrom::Start(0)).unwrap();
        let header = vec![0x55u8; 64];
        writer.write(&header).unwrap();
        writer.close().unwrap();

        let stored = client.object_bytes("b", "k").unwrap();
        assert_eq!(stored.len(), MIB);
        assert_eq!(&stored[..64], header.as_slice());
        assert!(stored[64..].iter().all(|&byte| byte == 0xAA));
    }

    #[test]
    fn header_patch_on_a_multipart_object() {
        let client = MockClient::shared();
        let mut writer = writer(
            &client,
            SeekableWriterOptions {
                head_block_size: Some(64),
                tail_block_size: Some(256),
                ..SeekableWriterOptions::default()
            },
        );

        let body: Vec<u8> = (0..20 * MIB).map(|index| (index % 251) as u8).collect();
        for chunk in body.chunks(MIB) {
            writer.write(chunk).unwrap();
        }

        // the middle region has been shipped; it can no longer be seeked
        assert!(matches!(
            writer.seek(io::SeekFrom::Start(100)),
            Err(Error::InvalidSeek { .. })
        ));

        writer.seek(io::SeekFrom::Start(0)).unwrap();
        writer.write(&vec![0xEEu8; 64]).unwrap();
        writer.close().unwrap();

        let stored = client.object_bytes("b", "k").unwrap();
        assert_eq!(stored.len(), 20 * MIB);
        assert!(stored[..64].iter().all(|&byte| byte == 0xEE));
        assert_eq!(&stored[64..], &body[64..]);
    }

    #[test]
    fn tail_region_allows_overwrite() {
        let client = MockClient::shared();
        let mut writer = writer(
            &client,
            SeekableWriterOptions {
                head_block_size: Some(4),
                ..SeekableWriterOptions::default()
            },
        );

        writer.write(b"headtail").unwrap();
        writer.seek(io::SeekFrom::End(-4)).unwrap();
        writer.write(b"TAIL").unwrap();
        writer.close().unwrap();

        assert_eq!(
            client.object_bytes("b", "k").unwrap().as_ref(),
            b"headTAIL"
        );
    }

    #[test]
    fn closed_writer_rejects_everything() {
        let client = MockClient::shared();
        let mut writer = writer(
            &client,
            SeekableWriterOptions {
                head_block_size: Some(4),
                ..SeekableWriterOptions::default()
            },
        );
        writer.write(b"data").unwrap();
        writer.close().unwrap();

        assert!(matches!(writer.write(b"x"), Err(Error::InvalidState { .. })));
        assert!(matches!(
            writer.seek(io::SeekFrom::Start(0)),
            Err(Error::InvalidState { .. })
        ));
    }
}
