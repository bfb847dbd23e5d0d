//! Streaming handles: prefetch readers, multipart writers, pipes and the
//! byte-level plumbing they share.
use crate::{Error, Result};
use std::io;

pub(crate) mod block_cache;
mod combine;
mod memory;
mod pipe;
pub(crate) mod pool;
mod prefetch;
mod seekable;
mod share_cache;
mod writer;

pub use combine::CombineReader;
pub use memory::{CachedHandler, MemoryHandler};
pub use pipe::{PipeReader, PipeWriter};
pub use prefetch::{PrefetchReader, RangeSource, ReaderOptions};
pub use seekable::{LimitedSeekableWriter, SeekableWriterOptions};
pub use share_cache::ShareCacheReader;
pub use writer::{BufferedWriter, WriterOptions, MIN_PART_SIZE};

pub(crate) const NEWLINE: u8 = b'\n';

/// The uniform byte-stream surface every open style implements.
///
/// `read`/`readline` with `size: None` read to EOF. Operations a handle does
/// not support fail with [`Error::Unsupported`]; operations on a closed
/// handle fail with [`Error::InvalidState`].
pub trait FileLike: Send {
    fn name(&self) -> &str;
    fn mode(&self) -> &'static str;

    fn readable(&self) -> bool {
        false
    }
    fn writable(&self) -> bool {
        false
    }
    fn seekable(&self) -> bool {
        false
    }

    fn read(&mut self, _size: Option<usize>) -> Result<Vec<u8>> {
        Err(Error::unsupported(self.name(), "read"))
    }

    fn readline(&mut self, _size: Option<usize>) -> Result<Vec<u8>> {
        Err(Error::unsupported(self.name(), "readline"))
    }

    fn readinto(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::unsupported(self.name(), "readinto"))
    }

    fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Error::unsupported(self.name(), "write"))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn seek(&mut self, _pos: io::SeekFrom) -> Result<u64> {
        Err(Error::unsupported(self.name(), "seek"))
    }

    fn tell(&self) -> u64;

    /// Content size in bytes. Defaults to a seek dance on seekable handles.
    fn size(&mut self) -> Result<u64> {
        if !self.seekable() {
            return Err(Error::unsupported(self.name(), "size"));
        }
        let current = self.tell();
        let end = self.seek(io::SeekFrom::End(0))?;
        self.seek(io::SeekFrom::Start(current))?;
        Ok(end)
    }

    /// Raw file descriptor, for handles backed by a real local file.
    fn fileno(&self) -> Result<i32> {
        Err(Error::unsupported(self.name(), "fileno"))
    }

    fn close(&mut self) -> Result<()>;
}

impl io::Read for dyn FileLike + '_ {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.readinto(buf).map_err(Into::into)
    }
}

impl io::Write for dyn FileLike + '_ {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileLike::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        FileLike::flush(self).map_err(Into::into)
    }
}

impl io::Seek for dyn FileLike + '_ {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        FileLike::seek(self, pos).map_err(Into::into)
    }
}

/// Resolve a whence-style seek target against the current offset and size,
/// without clamping.
pub(crate) fn seek_target(pos: io::SeekFrom, offset: u64, size: u64) -> i64 {
    match pos {
        io::SeekFrom::Start(target) => target as i64,
        io::SeekFrom::Current(delta) => offset as i64 + delta,
        io::SeekFrom::End(delta) => size as i64 + delta,
    }
}
