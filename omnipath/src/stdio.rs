//! `stdio://-` backend: process stdin for reads, stdout for writes.
use crate::{
    path::{ModeOp, OpenMode, OpenOptions, PathOps, StatResult},
    stream::{FileLike, NEWLINE},
    Error, Result,
};
use std::{
    io::{self, BufRead, Read, Write},
    sync::Arc,
};

pub(crate) fn make_path(raw: String, _profile: Option<String>) -> Result<Arc<dyn PathOps>> {
    Ok(Arc::new(StdioPath::new(raw)))
}

pub struct StdioPath {
    raw: String,
}

impl StdioPath {
    pub fn new(raw: impl Into<String>) -> StdioPath {
        StdioPath { raw: raw.into() }
    }
}

impl PathOps for StdioPath {
    fn protocol(&self) -> &'static str {
        "stdio"
    }

    fn as_str(&self) -> &str {
        &self.raw
    }

    fn stat(&self, _follow_symlinks: bool) -> Result<StatResult> {
        Err(Error::unsupported(self.raw.clone(), "stat"))
    }

    fn exists(&self, _followlinks: bool) -> Result<bool> {
        Ok(true)
    }

    fn is_dir(&self) -> Result<bool> {
        Ok(false)
    }

    fn is_file(&self) -> Result<bool> {
        Ok(true)
    }

    fn open(&self, mode: &OpenMode, _options: &OpenOptions) -> Result<Box<dyn FileLike>> {
        if mode.update {
            return Err(Error::unsupported(self.raw.clone(), "update mode"));
        }
        match mode.op {
            ModeOp::Read => Ok(Box::new(StdinHandle {
                name: self.raw.clone(),
                offset: 0,
                closed: false,
            })),
            ModeOp::Write | ModeOp::Append | ModeOp::Exclusive => Ok(Box::new(StdoutHandle {
                name: self.raw.clone(),
                offset: 0,
                closed: false,
            })),
        }
    }
}

struct StdinHandle {
    name: String,
    offset: u64,
    closed: bool,
}

impl StdinHandle {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(self.name.clone()));
        }
        Ok(())
    }

    fn err(&self, source: io::Error) -> Error {
        crate::error::translate_fs_error(source, self.name.clone())
    }
}

impl FileLike for StdinHandle {
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
        self.ensure_open()?;
        let mut out = Vec::new();
        let stdin = io::stdin();
        let mut lock = stdin.lock();
        match size {
            Some(limit) => {
                let mut taken = lock.take(limit as u64);
                taken.read_to_end(&mut out).map_err(|err| self.err(err))?;
            }
            None => {
                lock.read_to_end(&mut out).map_err(|err| self.err(err))?;
            }
        }
        self.offset += out.len() as u64;
        Ok(out)
    }

    fn readline(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let stdin = io::stdin();
        let mut lock = stdin.lock();
        let mut out = Vec::new();
        match size {
            Some(limit) => {
                let mut taken = lock.take(limit as u64);
                taken
                    .read_until(NEWLINE, &mut out)
                    .map_err(|err| self.err(err))?;
            }
            None => {
                lock.read_until(NEWLINE, &mut out)
                    .map_err(|err| self.err(err))?;
            }
        }
        self.offset += out.len() as u64;
        Ok(out)
    }

    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = FileLike::read(self, Some(buf.len()))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

struct StdoutHandle {
    name: String,
    offset: u64,
    closed: bool,
}

impl FileLike for StdoutHandle {
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
        if self.closed {
            return Err(Error::invalid_state(self.name.clone()));
        }
        io::stdout()
            .write_all(data)
            .map_err(|err| crate::error::translate_fs_error(err, self.name.clone()))?;
        self.offset += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        io::stdout()
            .flush()
            .map_err(|err| crate::error::translate_fs_error(err, self.name.clone()))
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        FileLike::flush(self)
    }
}
