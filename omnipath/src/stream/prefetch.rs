//! Seekable reader over range-GET-capable remote objects.
//!
//! The object is divided into `block_size` windows. Reads pull from an LRU
//! cache of block fetches and prefetch `block_forward` blocks ahead; the
//! look-ahead shrinks automatically when the access pattern turns out to be
//! random.
use super::{
    block_cache::{FutureCache, SharedFutureCache},
    pool::TaskPool,
    seek_target, FileLike, NEWLINE,
};
use crate::{config::config, Error, Result};
use bytes::Bytes;
use std::{cmp::min, io, sync::Arc};

/// Capacity of the process-wide cache used by share-cache readers.
pub(crate) const SHARED_BLOCK_CAPACITY: usize = 32;

/// Where a reader keeps its block futures: a cache of its own, or the
/// process-wide cache keyed by `(object, block)`.
pub(crate) enum Blocks {
    Own(FutureCache<u64>),
    Shared {
        cache: Arc<SharedFutureCache>,
        object: String,
    },
}

impl Blocks {
    fn submit(
        &mut self,
        pool: &TaskPool,
        index: u64,
        name: &str,
        fetch: impl FnOnce() -> Result<Bytes> + Send + 'static,
    ) {
        match self {
            Blocks::Own(futures) => futures.submit(pool, index, name, fetch),
            Blocks::Shared { cache, object } => {
                cache.submit(pool, (object.clone(), index), fetch)
            }
        }
    }

    fn contains(&self, index: u64) -> bool {
        match self {
            Blocks::Own(futures) => futures.contains(&index),
            Blocks::Shared { cache, object } => cache.contains(&(object.clone(), index)),
        }
    }

    fn result(&mut self, index: u64) -> Option<Result<Bytes>> {
        match self {
            Blocks::Own(futures) => futures.result(&index),
            Blocks::Shared { cache, object } => cache.result(&(object.clone(), index)),
        }
    }

    fn cleanup(&mut self, capacity: usize) {
        match self {
            Blocks::Own(futures) => futures.cleanup(capacity),
            // the shared cache is bounded independently of any one reader
            Blocks::Shared { cache, .. } => cache.cleanup(SHARED_BLOCK_CAPACITY),
        }
    }

    fn close(&mut self) {
        match self {
            Blocks::Own(futures) => futures.clear(),
            Blocks::Shared { cache, object } => cache.unregister(object),
        }
    }
}

/// A remote object addressable by byte ranges.
///
/// `fetch` returns the inclusive range `start..=end`; implementations may
/// return fewer bytes at the end of the object. Implementations are expected
/// to verify their strong validator (ETag) on every fetch and fail with
/// [`Error::ObjectChanged`] when the object was replaced mid-read.
pub trait RangeSource: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn content_size(&self) -> u64;
    fn fetch(&self, start: u64, end: u64) -> Result<Bytes>;
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub block_size: u64,
    pub max_buffer_size: u64,
    pub block_forward: Option<usize>,
    pub max_workers: Option<usize>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        let config = config();
        ReaderOptions {
            block_size: config.reader_block_size,
            max_buffer_size: config.reader_max_buffer_size,
            block_forward: None,
            max_workers: None,
        }
    }
}

/// One entry of the sliding window describing the recent seek pattern.
struct SeekRecord {
    seek_index: u64,
    seek_count: usize,
    read_count: usize,
}

impl SeekRecord {
    fn new(seek_index: u64) -> Self {
        SeekRecord {
            seek_index,
            seek_count: 0,
            read_count: 0,
        }
    }
}

pub struct PrefetchReader {
    source: Arc<dyn RangeSource>,
    content_size: u64,
    block_size: u64,
    block_capacity: usize,
    block_forward: usize,
    auto_scaling: bool,
    // number of blocks in the object
    block_stop: u64,

    offset: u64,
    block_index: u64,
    // intra-block offset recorded at seek time, applied when the block is
    // actually accessed
    pending_offset: Option<u64>,
    current: Option<(Bytes, usize)>,
    seek_history: Vec<SeekRecord>,

    blocks: Blocks,
    pool: TaskPool,
    closed: bool,
}

impl PrefetchReader {
    pub fn new(source: Arc<dyn RangeSource>, options: ReaderOptions) -> Result<PrefetchReader> {
        Self::with_blocks(source, options, None)
    }

    /// Variant bound to a process-wide cache. Registration of the object
    /// name must already have happened.
    pub(crate) fn with_blocks(
        source: Arc<dyn RangeSource>,
        options: ReaderOptions,
        shared: Option<Arc<SharedFutureCache>>,
    ) -> Result<PrefetchReader> {
        if options.block_size == 0 {
            return Err(Error::InvalidArgument {
                detail: "block_size must be bigger than 0".to_string(),
            });
        }

        let (block_capacity, forced_forward) = if options.max_buffer_size == 0 {
            (0, Some(0))
        } else {
            (
                (options.max_buffer_size / options.block_size).max(1) as usize,
                options.block_forward,
            )
        };

        let mut auto_scaling = false;
        let block_forward = match forced_forward {
            Some(forward) => forward,
            None => {
                let forward = block_capacity.saturating_sub(1);
                auto_scaling = forward > 0;
                forward
            }
        };

        if block_capacity > 0 && block_forward >= block_capacity {
            return Err(Error::InvalidArgument {
                detail: format!(
                    "max_buffer_size should be greater than block_forward * block_size, \
                     got: max_buffer_size={}, block_size={}, block_forward={}",
                    options.max_buffer_size, options.block_size, block_forward
                ),
            });
        }

        let content_size = source.content_size();
        let blocks = match shared {
            Some(cache) => Blocks::Shared {
                cache,
                object: source.name().to_string(),
            },
            None => Blocks::Own(FutureCache::new()),
        };
        let mut reader = PrefetchReader {
            content_size,
            block_size: options.block_size,
            block_capacity,
            block_forward,
            auto_scaling,
            block_stop: content_size.div_ceil(options.block_size),
            offset: 0,
            block_index: 0,
            pending_offset: None,
            current: None,
            seek_history: Vec::new(),
            blocks,
            pool: TaskPool::from_max_workers(options.max_workers),
            closed: false,
            source,
        };
        reader.seek_buffer(0, 0);

        tracing::debug!("open file: {}, mode: rb", reader.source.name());
        Ok(reader)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(self.source.name()));
        }
        Ok(())
    }

    fn record_read(&mut self) {
        if let Some(record) = self.seek_history.last_mut() {
            record.read_count += 1;
        }
    }

    fn submit(&mut self, index: u64) {
        if index >= self.block_stop {
            return;
        }
        let source = self.source.clone();
        let block_size = self.block_size;
        let content_size = self.content_size;
        let name = source.name().to_string();
        self.blocks.submit(&self.pool, index, &name, move || {
            let start = index * block_size;
            let end = min(start + block_size, content_size) - 1;
            source.fetch(start, end)
        });
    }

    /// The current block's buffer, fetching and prefetching as needed.
    fn ensure_buffer(&mut self) -> Result<&mut (Bytes, usize)> {
        if let Some(pending) = self.pending_offset {
            let data = if self.block_capacity == 0 {
                // cacheless: fetch exactly the one block
                let start = self.block_index * self.block_size;
                let end = min(start + self.block_size, self.content_size) - 1;
                self.source.fetch(start, end)?
            } else {
                if self.block_forward > 0 {
                    let start = self.block_index;
                    let stop = min(start + self.block_forward as u64, self.block_stop);
                    // reverse order, so the nearest block ends up most
                    // recently used
                    for index in (start..=stop).rev() {
                        self.submit(index);
                    }
                } else {
                    self.submit(self.block_index);
                }
                self.blocks.cleanup(self.block_capacity);
                match self.blocks.result(self.block_index) {
                    Some(result) => result?,
                    None => return Err(Error::invalid_state(self.source.name())),
                }
            };
            self.current = Some((data, pending as usize));
            self.pending_offset = None;
        }

        match self.current.as_mut() {
            Some(buffer) => Ok(buffer),
            None => Err(Error::invalid_state(self.source.name())),
        }
    }

    fn advance_block(&mut self) {
        self.block_index += 1;
        self.pending_offset = Some(0);
        self.current = None;
    }

    fn seek_buffer(&mut self, index: u64, offset: u64) {
        if self.auto_scaling {
            let capacity = self.block_capacity;
            let mut history = Vec::with_capacity(self.seek_history.len() + 1);
            for mut record in self.seek_history.drain(..) {
                // drop records that have gone stale, and the ones adjacent
                // to the new position
                if record.seek_count > capacity * 2 {
                    continue;
                }
                if record.seek_index == index || record.seek_index == index + 1 {
                    continue;
                }
                record.seek_count += 1;
                history.push(record);
            }
            history.push(SeekRecord::new(index));

            self.block_forward = min(capacity / history.len(), capacity - 1);
            self.seek_history = history;
            if self.block_forward == 0 {
                // the pattern is random access; stop prefetching ahead
                self.auto_scaling = false;
                self.seek_history.clear();
            }
        }

        self.pending_offset = Some(offset);
        self.block_index = index;
        self.current = None;
    }

    /// Single exact-span range GET, bypassing the block cache.
    fn read_unbuffered(&mut self, want: usize) -> Result<Vec<u8>> {
        if want == 0 || self.offset >= self.content_size {
            return Ok(Vec::new());
        }
        let start = self.offset;
        let data = self.source.fetch(start, start + want as u64 - 1)?;
        self.seek(io::SeekFrom::Current(want as i64))?;
        Ok(data.to_vec())
    }

    pub fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;

        if self.offset >= self.content_size {
            return Ok(Vec::new());
        }
        let remaining = (self.content_size - self.offset) as usize;
        let want = size.map_or(remaining, |size| min(size, remaining));

        let mut buf = vec![0u8; want];
        let filled = self.readinto(&mut buf)?;
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        self.record_read();

        if self.offset >= self.content_size {
            return Ok(0);
        }
        let want = min(buf.len(), (self.content_size - self.offset) as usize);

        if self.block_capacity == 0 {
            let data = self.read_unbuffered(want)?;
            buf[..data.len()].copy_from_slice(&data);
            return Ok(data.len());
        }

        if self.block_forward == 0 {
            let block_index = self.offset / self.block_size;
            if !self.blocks.contains(block_index) {
                let data = self.read_unbuffered(want)?;
                buf[..data.len()].copy_from_slice(&data);
                return Ok(data.len());
            }
        } else if self.block_forward == 1 && !self.seek_history.is_empty() {
            // fewer than ~3 reads per seek means prefetching one block
            // ahead is wasted work
            let block_index = self.offset / self.block_size;
            let reads: usize = self
                .seek_history
                .iter()
                .map(|record| record.read_count)
                .sum();
            if !self.blocks.contains(block_index) && reads < 3 * self.seek_history.len() {
                let data = self.read_unbuffered(want)?;
                buf[..data.len()].copy_from_slice(&data);
                return Ok(data.len());
            }
        }

        let mut written = 0;
        while written < want {
            let (data, pos) = self.ensure_buffer()?;
            let available = data.len() - *pos;
            if available == 0 {
                self.advance_block();
                continue;
            }
            let count = min(available, want - written);
            buf[written..written + count].copy_from_slice(&data[*pos..*pos + count]);
            *pos += count;
            written += count;
        }

        self.offset += written as u64;
        Ok(written)
    }

    /// Read up to the next newline (retained) or `size` bytes, whichever
    /// comes first.
    pub fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.record_read();

        if self.offset >= self.content_size {
            return Ok(Vec::new());
        }
        let remaining = (self.content_size - self.offset) as usize;
        let limit = size.map_or(remaining, |size| min(size, remaining));

        let mut line = Vec::new();
        while line.len() < limit {
            let (data, pos) = self.ensure_buffer()?;
            if *pos >= data.len() {
                self.advance_block();
                continue;
            }
            let window = &data[*pos..min(*pos + limit - line.len(), data.len())];
            match window.iter().position(|&byte| byte == NEWLINE) {
                Some(at) => {
                    line.extend_from_slice(&window[..=at]);
                    *pos += at + 1;
                    break;
                }
                None => {
                    line.extend_from_slice(window);
                    *pos += window.len();
                }
            }
        }

        self.offset += line.len() as u64;
        Ok(line)
    }

    pub fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        self.ensure_open()?;

        let target = seek_target(pos, self.offset, self.content_size);
        if target == self.offset as i64 {
            return Ok(self.offset);
        }

        self.offset = target.clamp(0, self.content_size as i64) as u64;
        let block_index = self.offset / self.block_size;
        let block_offset = self.offset % self.block_size;
        self.seek_buffer(block_index, block_offset);
        Ok(self.offset)
    }

    pub fn tell(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.content_size
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        tracing::debug!("close file: {}", self.source.name());
        self.closed = true;
        self.blocks.close();
        self.pool.shutdown();
        Ok(())
    }

    #[cfg(test)]
    fn block_forward(&self) -> usize {
        self.block_forward
    }

    #[cfg(test)]
    fn is_auto_scaling(&self) -> bool {
        self.auto_scaling
    }
}

impl Drop for PrefetchReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl FileLike for PrefetchReader {
    fn name(&self) -> &str {
        self.source.name()
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
        PrefetchReader::read(self, size)
    }

    fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        PrefetchReader::readline(self, size)
    }

    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        PrefetchReader::readinto(self, buf)
    }

    fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        PrefetchReader::seek(self, pos)
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.content_size)
    }

    fn close(&mut self) -> Result<()> {
        PrefetchReader::close(self)
    }
}

impl io::Read for PrefetchReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.readinto(buf).map_err(Into::into)
    }
}

impl io::Seek for PrefetchReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        PrefetchReader::seek(self, pos).map_err(Into::into)
    }
}

#[cfg(any(test, feature = "test"))]
pub mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory range source counting its fetches.
    pub struct StaticSource {
        name: String,
        data: Bytes,
        fetches: AtomicUsize,
    }

    impl StaticSource {
        pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Arc<Self> {
            Arc::new(StaticSource {
                name: name.into(),
                data: data.into(),
                fetches: AtomicUsize::new(0),
            })
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl RangeSource for StaticSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn content_size(&self) -> u64 {
            self.data.len() as u64
        }

        fn fetch(&self, start: u64, end: u64) -> Result<Bytes> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let start = start as usize;
            let end = min(end as usize + 1, self.data.len());
            if start >= self.data.len() {
                return Err(Error::InvalidArgument {
                    detail: format!("range out of bounds: {start}-{end}"),
                });
            }
            Ok(self.data.slice(start..end))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test::StaticSource, *};

    fn options(block_size: u64, max_buffer_size: u64) -> ReaderOptions {
        ReaderOptions {
            block_size,
            max_buffer_size,
            block_forward: None,
            max_workers: None,
        }
    }

    #[test]
    fn range_read_across_blocks() {
        let source = StaticSource::new("mem://blocks", &b"block0 block1 block2 block3 block4 "[..]);
        let mut reader = PrefetchReader::new(source, options(7, 7 * 16)).unwrap();

        assert_eq!(reader.read(Some(2)).unwrap(), b"bl");
        assert_eq!(reader.read(Some(6)).unwrap(), b"ock0 b");
        assert_eq!(reader.read(Some(6)).unwrap(), b"lock1 ");
        assert_eq!(reader.read(Some(22)).unwrap(), b"block2 block3 block4 ");
        assert_eq!(reader.read(Some(1)).unwrap(), b"");
    }

    #[test]
    fn readline_spanning_blocks() {
        let source = StaticSource::new("mem://lines", &b"1\n2\n3\n\n4444\n5"[..]);
        let mut reader = PrefetchReader::new(source, options(3, 3 * 16)).unwrap();

        let mut lines = Vec::new();
        loop {
            let line = reader.readline(None).unwrap();
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        assert_eq!(
            lines,
            vec![
                b"1\n".to_vec(),
                b"2\n".to_vec(),
                b"3\n".to_vec(),
                b"\n".to_vec(),
                b"4444\n".to_vec(),
                b"5".to_vec(),
            ]
        );
    }

    #[test]
    fn adaptive_look_ahead_shrinks_on_random_access() {
        let data: Vec<u8> = (0u8..36).collect();
        let source = StaticSource::new("mem://random", data);
        let mut reader = PrefetchReader::new(source, options(1, 6)).unwrap();
        assert!(reader.is_auto_scaling());
        assert_eq!(reader.block_forward(), 5);

        let mut position = 34i64;
        while position >= 0 {
            reader.seek(io::SeekFrom::Start(position as u64)).unwrap();
            let byte = reader.read(Some(1)).unwrap();
            assert_eq!(byte, vec![position as u8]);
            position -= 2;
        }

        assert_eq!(reader.block_forward(), 0);
        assert!(!reader.is_auto_scaling());
    }

    #[test]
    fn whole_object_round_trips() {
        let data: Vec<u8> = (0..100_000u32).map(|value| value as u8).collect();
        for (block_size, max_buffer_size) in [(1024, 8 * 1024), (4096, 4096), (100_000, 400_000)] {
            let source = StaticSource::new("mem://all", data.clone());
            let mut reader =
                PrefetchReader::new(source, options(block_size, max_buffer_size)).unwrap();
            assert_eq!(reader.read(None).unwrap(), data);
            assert_eq!(reader.read(Some(1)).unwrap(), b"");
        }
    }

    #[test]
    fn unbuffered_mode_issues_exact_range_gets() {
        let source = StaticSource::new("mem://direct", &b"0123456789"[..]);
        let mut reader = PrefetchReader::new(source.clone(), options(4, 0)).unwrap();

        assert_eq!(reader.read(Some(3)).unwrap(), b"012");
        assert_eq!(reader.read(Some(3)).unwrap(), b"345");
        assert_eq!(source.fetch_count(), 2);
        assert_eq!(reader.read(None).unwrap(), b"6789");
        assert_eq!(source.fetch_count(), 3);
    }

    #[test]
    fn readinto_respects_buffer_length() {
        let source = StaticSource::new("mem://into", &b"abcdefgh"[..]);
        let mut reader = PrefetchReader::new(source, options(3, 3 * 4)).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(reader.readinto(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"abcde");
        // partial read at EOF
        assert_eq!(reader.readinto(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"fgh");
        assert_eq!(reader.readinto(&mut buf).unwrap(), 0);
    }

    #[test]
    fn seek_is_clamped_to_the_object() {
        let source = StaticSource::new("mem://clamp", &b"0123456789"[..]);
        let mut reader = PrefetchReader::new(source, options(4, 16)).unwrap();

        assert_eq!(reader.seek(io::SeekFrom::Start(100)).unwrap(), 10);
        assert_eq!(reader.read(Some(1)).unwrap(), b"");
        assert_eq!(reader.seek(io::SeekFrom::End(-4)).unwrap(), 6);
        assert_eq!(reader.read(None).unwrap(), b"6789");
        assert_eq!(reader.seek(io::SeekFrom::Current(-100)).unwrap(), 0);
    }

    #[test]
    fn closed_reader_operations_fail() {
        let source = StaticSource::new("mem://closed", &b"data"[..]);
        let mut reader = PrefetchReader::new(source, options(2, 8)).unwrap();
        reader.close().unwrap();

        assert!(matches!(
            reader.read(Some(1)),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            reader.seek(io::SeekFrom::Start(0)),
            Err(Error::InvalidState { .. })
        ));
        // close is idempotent
        assert!(reader.close().is_ok());
    }

    #[test]
    fn forward_must_stay_below_capacity() {
        let source = StaticSource::new("mem://args", &b"data"[..]);
        let result = PrefetchReader::new(
            source,
            ReaderOptions {
                block_size: 1,
                max_buffer_size: 4,
                block_forward: Some(4),
                max_workers: None,
            },
        );
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn fetch_errors_surface_on_read() {
        struct Failing;
        impl RangeSource for Failing {
            fn name(&self) -> &str {
                "mem://failing"
            }
            fn content_size(&self) -> u64 {
                10
            }
            fn fetch(&self, _start: u64, _end: u64) -> Result<Bytes> {
                Err(Error::ObjectChanged {
                    path: "mem://failing".to_string(),
                    before: "a".to_string(),
                    after: "b".to_string(),
                })
            }
        }

        let mut reader = PrefetchReader::new(Arc::new(Failing), options(4, 16)).unwrap();
        assert!(matches!(
            reader.read(None),
            Err(Error::ObjectChanged { .. })
        ));
        // the reader stays open and can still be closed cleanly
        assert!(reader.close().is_ok());
    }
}
