//! Virtual concatenation of seekable readers as one seekable stream.
use super::{seek_target, FileLike, NEWLINE};
use crate::{Error, Result};
use std::io;

pub struct CombineReader {
    name: String,
    mode: &'static str,
    files: Vec<Box<dyn FileLike>>,
    // cumulative start offsets, one extra entry for the total size
    starts: Vec<u64>,
    offset: u64,
    closed: bool,
}

impl CombineReader {
    pub fn new(mut files: Vec<Box<dyn FileLike>>, name: impl Into<String>) -> Result<CombineReader> {
        let name = name.into();
        let mut mode = None;
        let mut starts = Vec::with_capacity(files.len() + 1);
        let mut total = 0u64;

        for file in files.iter_mut() {
            if !file.readable() {
                return Err(Error::unsupported(file.name(), "read"));
            }
            if !file.seekable() {
                return Err(Error::unsupported(file.name(), "seek"));
            }
            match mode {
                None => mode = Some(file.mode()),
                Some(expected) if expected != file.mode() => {
                    return Err(Error::InvalidArgument {
                        detail: format!(
                            "inconsistent mode: {}, expected: {expected:?}, got: {:?}",
                            file.name(),
                            file.mode()
                        ),
                    })
                }
                Some(_) => {}
            }
            starts.push(total);
            total += file.size()?;
        }
        starts.push(total);

        Ok(CombineReader {
            name,
            mode: mode.unwrap_or("rb"),
            files,
            starts,
            offset: 0,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(self.name.clone()));
        }
        Ok(())
    }

    fn content_size(&self) -> u64 {
        *self.starts.last().unwrap_or(&0)
    }

    /// Segment holding the current offset, and the offset within it.
    fn segment(&self) -> Result<(usize, u64)> {
        for (index, &start) in self.starts.iter().enumerate().skip(1) {
            if self.offset < start {
                return Ok((index - 1, self.offset - self.starts[index - 1]));
            }
        }
        Err(Error::InvalidSeek {
            path: self.name.clone(),
            offset: self.offset as i64,
        })
    }

    pub fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if self.offset >= self.content_size() {
            return Ok(Vec::new());
        }
        let remaining = (self.content_size() - self.offset) as usize;
        let mut want = size.map_or(remaining, |size| size.min(remaining));

        let mut out = Vec::with_capacity(want);
        while want > 0 && self.offset < self.content_size() {
            let (index, intra) = self.segment()?;
            let file = &mut self.files[index];
            file.seek(io::SeekFrom::Start(intra))?;
            let data = file.read(Some(want))?;
            if data.is_empty() {
                break;
            }
            want -= data.len();
            self.offset += data.len() as u64;
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    pub fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if self.offset >= self.content_size() {
            return Ok(Vec::new());
        }
        let remaining = (self.content_size() - self.offset) as usize;
        let limit = size.map_or(remaining, |size| size.min(remaining));

        let mut out = Vec::new();
        while out.len() < limit {
            let (index, intra) = self.segment()?;
            let file = &mut self.files[index];
            file.seek(io::SeekFrom::Start(intra))?;
            let data = file.readline(Some(limit - out.len()))?;
            if data.is_empty() {
                break;
            }
            self.offset += data.len() as u64;
            out.extend_from_slice(&data);
            if out.last() == Some(&NEWLINE) {
                break;
            }
        }
        Ok(out)
    }

    pub fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.read(Some(buf.len()))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    pub fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        let target = seek_target(pos, self.offset, self.content_size());
        if target < 0 {
            return Err(Error::InvalidSeek {
                path: self.name.clone(),
                offset: target,
            });
        }
        self.offset = target as u64;
        Ok(self.offset)
    }

    pub fn tell(&self) -> u64 {
        self.offset
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for file in self.files.iter_mut() {
            file.close()?;
        }
        Ok(())
    }
}

impl Drop for CombineReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl FileLike for CombineReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> &'static str {
        self.mode
    }

    fn readable(&self) -> bool {
        true
    }

    fn seekable(&self) -> bool {
        true
    }

    fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        CombineReader::read(self, size)
    }

    fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        CombineReader::readline(self, size)
    }

    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        CombineReader::readinto(self, buf)
    }

    fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        CombineReader::seek(self, pos)
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.content_size())
    }

    fn close(&mut self) -> Result<()> {
        CombineReader::close(self)
    }
}

impl io::Read for CombineReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.readinto(buf).map_err(Into::into)
    }
}

impl io::Seek for CombineReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        CombineReader::seek(self, pos).map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::super::prefetch::{test::StaticSource, PrefetchReader, ReaderOptions};
    use super::*;

    fn reader(name: &str, data: &'static [u8]) -> Box<dyn FileLike> {
        let source = StaticSource::new(name, data);
        Box::new(
            PrefetchReader::new(
                source,
                ReaderOptions {
                    block_size: 4,
                    max_buffer_size: 64,
                    block_forward: None,
                    max_workers: None,
                },
            )
            .unwrap(),
        )
    }

    fn combined() -> CombineReader {
        CombineReader::new(
            vec![
                reader("mem://a", b"first\nsec"),
                reader("mem://b", b"ond\n"),
                reader("mem://c", b"third"),
            ],
            "combine://abc",
        )
        .unwrap()
    }

    #[test]
    fn reads_span_segments() {
        let mut reader = combined();
        assert_eq!(reader.read(None).unwrap(), b"first\nsecond\nthird");
        assert_eq!(reader.read(Some(1)).unwrap(), b"");
    }

    #[test]
    fn readline_crosses_segment_boundaries() {
        let mut reader = combined();
        assert_eq!(reader.readline(None).unwrap(), b"first\n");
        assert_eq!(reader.readline(None).unwrap(), b"second\n");
        assert_eq!(reader.readline(None).unwrap(), b"third");
        assert_eq!(reader.readline(None).unwrap(), b"");
    }

    #[test]
    fn seek_and_tell_use_the_flat_offset() {
        let mut reader = combined();
        assert_eq!(reader.seek(io::SeekFrom::Start(6)).unwrap(), 6);
        assert_eq!(reader.read(Some(6)).unwrap(), b"second");
        assert_eq!(reader.tell(), 12);
        assert_eq!(reader.seek(io::SeekFrom::End(-5)).unwrap(), 13);
        assert_eq!(reader.read(None).unwrap(), b"third");
    }

    #[test]
    fn negative_seek_is_an_error() {
        let mut reader = combined();
        assert!(matches!(
            reader.seek(io::SeekFrom::Current(-1)),
            Err(Error::InvalidSeek { .. })
        ));
    }
}
