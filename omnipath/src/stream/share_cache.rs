//! Prefetch reader variant backed by a process-wide block cache.
//!
//! Blocks are keyed by `(object, index)`, so many readers of the same object
//! share fetches. Intended for workloads that open lots of small objects
//! concurrently; look-ahead is fixed rather than auto-scaled.
use super::{
    block_cache::SharedFutureCache,
    prefetch::{PrefetchReader, RangeSource, ReaderOptions},
    FileLike,
};
use crate::Result;
use std::{io, sync::Arc};

pub(crate) const DEFAULT_BLOCK_FORWARD: usize = 12;

pub struct ShareCacheReader {
    inner: PrefetchReader,
}

impl ShareCacheReader {
    pub fn new(
        source: Arc<dyn RangeSource>,
        cache_key: &str,
        mut options: ReaderOptions,
    ) -> Result<ShareCacheReader> {
        if options.block_forward.is_none() && options.max_buffer_size > 0 {
            let capacity = (options.max_buffer_size / options.block_size.max(1)).max(1) as usize;
            options.block_forward = Some(DEFAULT_BLOCK_FORWARD.min(capacity.saturating_sub(1)));
        }

        let cache = SharedFutureCache::named(cache_key);
        cache.register(source.name());
        // unregister on construction failure, or the object leaks a refcount
        match PrefetchReader::with_blocks(source.clone(), options, Some(cache.clone())) {
            Ok(inner) => Ok(ShareCacheReader { inner }),
            Err(err) => {
                cache.unregister(source.name());
                Err(err)
            }
        }
    }

    pub fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.inner.read(size)
    }

    pub fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.inner.readline(size)
    }

    pub fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.readinto(buf)
    }

    pub fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        self.inner.seek(pos)
    }

    pub fn tell(&self) -> u64 {
        self.inner.tell()
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

impl FileLike for ShareCacheReader {
    fn name(&self) -> &str {
        self.inner.name()
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
        self.inner.read(size)
    }

    fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.inner.readline(size)
    }

    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.readinto(buf)
    }

    fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        self.inner.seek(pos)
    }

    fn tell(&self) -> u64 {
        self.inner.tell()
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.inner.size())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

impl io::Read for ShareCacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.readinto(buf).map_err(Into::into)
    }
}

impl io::Seek for ShareCacheReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos).map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::super::prefetch::test::StaticSource;
    use super::*;

    fn options(block_size: u64) -> ReaderOptions {
        ReaderOptions {
            block_size,
            max_buffer_size: block_size * 64,
            block_forward: None,
            max_workers: None,
        }
    }

    #[test]
    fn readers_of_one_object_share_fetches() {
        let source = StaticSource::new("mem://shared-object", &b"0123456789abcdef"[..]);

        let mut first = ShareCacheReader::new(source.clone(), "share-test", options(4)).unwrap();
        assert_eq!(first.read(None).unwrap(), b"0123456789abcdef");
        let after_first = source.fetch_count();

        let mut second = ShareCacheReader::new(source.clone(), "share-test", options(4)).unwrap();
        assert_eq!(second.read(None).unwrap(), b"0123456789abcdef");
        // every block was already cached by the first reader
        assert_eq!(source.fetch_count(), after_first);

        first.close().unwrap();
        second.close().unwrap();
    }

    #[test]
    fn close_drops_the_last_reference() {
        let source = StaticSource::new("mem://share-close", &b"abcd"[..]);

        let mut reader = ShareCacheReader::new(source.clone(), "share-close", options(2)).unwrap();
        assert_eq!(reader.read(Some(2)).unwrap(), b"ab");
        reader.close().unwrap();

        // after the last unregister the blocks are gone: a fresh reader
        // fetches again
        let before = source.fetch_count();
        let mut reader = ShareCacheReader::new(source.clone(), "share-close", options(2)).unwrap();
        assert_eq!(reader.read(None).unwrap(), b"abcd");
        assert!(source.fetch_count() > before);
        reader.close().unwrap();
    }
}
