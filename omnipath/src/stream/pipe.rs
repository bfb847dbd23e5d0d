//! Streaming handles that bridge byte-at-a-time callers to a client-driven
//! whole-object transfer.
//!
//! A bounded channel stands in for the OS pipe: the worker thread drives
//! `download_to`/`upload_from` against one end, the caller reads or writes
//! the other. Writes block only when the consumer is behind; reads see EOF
//! only once the producer is done; worker errors surface on the next caller
//! operation.
use super::{FileLike, NEWLINE};
use crate::{client::ObjectClient, Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{cmp::min, io, sync::Arc, thread};

/// Chunks buffered between the two ends before back-pressure kicks in.
const PIPE_DEPTH: usize = 16;

type ErrorSlot = Arc<Mutex<Option<Error>>>;

// The worker must record its error while it still holds its channel end;
// recording after the channel closes would let the caller observe EOF or a
// send failure before the error is visible.
fn spawn_worker(
    name: &str,
    work: impl FnOnce(&ErrorSlot) + Send + 'static,
) -> Result<(thread::JoinHandle<()>, ErrorSlot)> {
    let slot: ErrorSlot = Arc::default();
    let worker_slot = slot.clone();
    let handle = thread::Builder::new()
        .name("omnipath-pipe".to_string())
        .spawn(move || work(&worker_slot))
        .map_err(|err| Error::unknown(name, anyhow::anyhow!(err)))?;
    Ok((handle, slot))
}

struct ChannelWriter {
    tx: flume::Sender<Bytes>,
}

impl io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ChannelReader {
    rx: flume::Receiver<Bytes>,
    current: Option<(Bytes, usize)>,
}

impl io::Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some((chunk, pos)) = self.current.as_mut() {
                if *pos < chunk.len() {
                    let count = min(buf.len(), chunk.len() - *pos);
                    buf[..count].copy_from_slice(&chunk[*pos..*pos + count]);
                    *pos += count;
                    return Ok(count);
                }
                self.current = None;
            }
            match self.rx.recv() {
                Ok(chunk) => self.current = Some((chunk, 0)),
                // producer is gone: EOF
                Err(_) => return Ok(0),
            }
        }
    }
}

/// Read side of a piped download.
pub struct PipeReader {
    name: String,
    rx: Option<flume::Receiver<Bytes>>,
    current: Option<(Bytes, usize)>,
    worker: Option<thread::JoinHandle<()>>,
    error: ErrorSlot,
    join_thread: bool,
    offset: u64,
    closed: bool,
}

impl PipeReader {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        name: impl Into<String>,
        join_thread: bool,
    ) -> Result<PipeReader> {
        let name = name.into();
        let bucket = bucket.into();
        let key = key.into();
        let (tx, rx) = flume::bounded::<Bytes>(PIPE_DEPTH);

        let (worker, error) = spawn_worker(&name, move |slot| {
            let mut writer = ChannelWriter { tx };
            if let Err(err) = client.download_to(&bucket, &key, &mut writer) {
                *slot.lock() = Some(err);
            }
            // the writer (and with it the sender) drops here, after any
            // error became visible
        })?;

        tracing::debug!("open file: {name}, mode: rb");
        Ok(PipeReader {
            name,
            rx: Some(rx),
            current: None,
            worker: Some(worker),
            error,
            join_thread,
            offset: 0,
            closed: false,
        })
    }

    fn check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(self.name.clone()));
        }
        if let Some(err) = self.error.lock().as_ref() {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Pull the next chunk into `current`; false at EOF.
    fn fill(&mut self) -> Result<bool> {
        if let Some((chunk, pos)) = &self.current {
            if *pos < chunk.len() {
                return Ok(true);
            }
        }
        let Some(rx) = &self.rx else { return Ok(false) };
        match rx.recv() {
            Ok(chunk) => {
                self.current = Some((chunk, 0));
                Ok(true)
            }
            Err(_) => {
                // drained; if the worker died with an error, surface it now
                self.check()?;
                Ok(false)
            }
        }
    }

    pub fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.check()?;
        let mut out = Vec::new();
        while size.map_or(true, |limit| out.len() < limit) {
            if !self.fill()? {
                break;
            }
            if let Some((chunk, pos)) = self.current.as_mut() {
                let available = chunk.len() - *pos;
                let count = match size {
                    Some(limit) => min(available, limit - out.len()),
                    None => available,
                };
                out.extend_from_slice(&chunk[*pos..*pos + count]);
                *pos += count;
            }
        }
        self.offset += out.len() as u64;
        Ok(out)
    }

    pub fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.check()?;
        let mut out = Vec::new();
        while size.map_or(true, |limit| out.len() < limit) {
            if !self.fill()? {
                break;
            }
            if let Some((chunk, pos)) = self.current.as_mut() {
                let limit = size.map_or(chunk.len() - *pos, |limit| {
                    min(limit - out.len(), chunk.len() - *pos)
                });
                let window = &chunk[*pos..*pos + limit];
                match window.iter().position(|&byte| byte == NEWLINE) {
                    Some(at) => {
                        out.extend_from_slice(&window[..=at]);
                        *pos += at + 1;
                        break;
                    }
                    None => {
                        out.extend_from_slice(window);
                        *pos += window.len();
                    }
                }
            }
        }
        self.offset += out.len() as u64;
        Ok(out)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        tracing::debug!("close file: {}", self.name);
        self.closed = true;
        self.current = None;
        // dropping the receiver unblocks a producer stuck on a full channel
        self.rx = None;
        if let Some(worker) = self.worker.take() {
            if self.join_thread {
                let _ = worker.join();
            }
        }
        if let Some(err) = self.error.lock().as_ref() {
            return Err(err.clone());
        }
        Ok(())
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl FileLike for PipeReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> &'static str {
        "rb"
    }

    fn readable(&self) -> bool {
        true
    }

    fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        PipeReader::read(self, size)
    }

    fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        PipeReader::readline(self, size)
    }

    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = PipeReader::read(self, Some(buf.len()))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn close(&mut self) -> Result<()> {
        PipeReader::close(self)
    }
}

/// Write side of a piped upload.
pub struct PipeWriter {
    name: String,
    tx: Option<flume::Sender<Bytes>>,
    worker: Option<thread::JoinHandle<()>>,
    error: ErrorSlot,
    join_thread: bool,
    offset: u64,
    closed: bool,
}

impl PipeWriter {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        name: impl Into<String>,
        join_thread: bool,
    ) -> Result<PipeWriter> {
        let name = name.into();
        let bucket = bucket.into();
        let key = key.into();
        let (tx, rx) = flume::bounded::<Bytes>(PIPE_DEPTH);

        let (worker, error) = spawn_worker(&name, move |slot| {
            let mut reader = ChannelReader { rx, current: None };
            if let Err(err) = client.upload_from(&bucket, &key, &mut reader) {
                *slot.lock() = Some(err);
            }
        })?;

        tracing::debug!("open file: {name}, mode: wb");
        Ok(PipeWriter {
            name,
            tx: Some(tx),
            worker: Some(worker),
            error,
            join_thread,
            offset: 0,
            closed: false,
        })
    }

    fn check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(self.name.clone()));
        }
        if let Some(err) = self.error.lock().as_ref() {
            return Err(err.clone());
        }
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check()?;
        let Some(tx) = &self.tx else {
            return Err(Error::invalid_state(self.name.clone()));
        };
        if tx.send(Bytes::copy_from_slice(data)).is_err() {
            // the worker stopped consuming; its error is more useful than
            // a bare broken pipe
            self.check()?;
            return Err(Error::unknown(
                self.name.clone(),
                anyhow::anyhow!("upload worker exited early"),
            ));
        }
        self.offset += data.len() as u64;
        Ok(data.len())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        tracing::debug!("close file: {}", self.name);
        self.closed = true;
        // dropping the sender is EOF for the uploader
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            if self.join_thread {
                let _ = worker.join();
            }
        }
        if let Some(err) = self.error.lock().as_ref() {
            return Err(err.clone());
        }
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl FileLike for PipeWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> &'static str {
        "wb"
    }

    fn writable(&self) -> bool {
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        PipeWriter::write(self, data)
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn close(&mut self) -> Result<()> {
        PipeWriter::close(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::test::MockClient;

    #[test]
    fn piped_download_streams_the_object() {
        let client = MockClient::shared();
        client.create_bucket("b");
        client.insert_object("b", "k", &b"line one\nline two\n"[..]);

        let mut reader = PipeReader::new(client, "b", "k", "s3://b/k", true).unwrap();
        assert_eq!(reader.readline(None).unwrap(), b"line one\n");
        assert_eq!(reader.read(Some(5)).unwrap(), b"line ");
        assert_eq!(reader.read(None).unwrap(), b"two\n");
        assert_eq!(reader.read(None).unwrap(), b"");
        reader.close().unwrap();
    }

    #[test]
    fn piped_upload_round_trips() {
        let client = MockClient::shared();
        client.create_bucket("b");

        let mut writer = PipeWriter::new(client.clone(), "b", "k", "s3://b/k", true).unwrap();
        writer.write(b"hello ").unwrap();
        writer.write(b"pipe").unwrap();
        writer.close().unwrap();

        assert_eq!(client.object_bytes("b", "k").unwrap().as_ref(), b"hello pipe");
    }

    #[test]
    fn worker_errors_surface_on_the_caller() {
        let client = MockClient::shared();
        // no bucket: the download fails inside the worker
        let mut reader = PipeReader::new(client, "missing", "k", "s3://missing/k", true).unwrap();
        let result = reader.read(None);
        assert!(matches!(result, Err(Error::BucketNotFound { .. })));
        // close re-raises the captured error
        assert!(reader.close().is_err());
    }
}
