//! One path surface over every backend.
//!
//! A protocol registry maps scheme names to path factories; [`AnyPath`]
//! parses a URI, picks the backend and exposes the uniform operation set.
//! Registering a new backend is one table insert.
use crate::{stream::FileLike, Error, Result};
use std::{collections::HashMap, path::PathBuf, sync::Arc, sync::OnceLock};

#[derive(Debug, Clone, Default)]
pub struct StatResult {
    pub size: u64,
    /// Unix seconds.
    pub mtime: f64,
    pub ctime: f64,
    pub is_dir: bool,
    pub is_link: bool,
    /// Backend-specific fields, e.g. ETag or HTTP headers.
    pub extra: HashMap<String, String>,
}

impl StatResult {
    pub fn directory() -> StatResult {
        StatResult {
            is_dir: true,
            ..StatResult::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub stat: StatResult,
}

pub type EntryIter = Box<dyn Iterator<Item = Result<FileEntry>> + Send>;
/// `(root, dirs, files)` triples, names sorted.
pub type WalkIter = Box<dyn Iterator<Item = Result<(String, Vec<String>, Vec<String>)>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeOp {
    Read,
    Write,
    Append,
    /// Like write, but fails if the destination already exists.
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub op: ModeOp,
    pub update: bool,
    pub binary: bool,
}

impl OpenMode {
    pub fn parse(mode: &str) -> Result<OpenMode> {
        let mut op = None;
        let mut update = false;
        let mut binary = None;
        for c in mode.chars() {
            match c {
                'r' | 'w' | 'a' | 'x' if op.is_none() => {
                    op = Some(match c {
                        'r' => ModeOp::Read,
                        'w' => ModeOp::Write,
                        'a' => ModeOp::Append,
                        _ => ModeOp::Exclusive,
                    })
                }
                '+' if !update => update = true,
                'b' if binary.is_none() => binary = Some(true),
                't' if binary.is_none() => binary = Some(false),
                _ => {
                    return Err(Error::InvalidArgument {
                        detail: format!("invalid mode: {mode:?}"),
                    })
                }
            }
        }
        match op {
            Some(op) => Ok(OpenMode {
                op,
                update,
                binary: binary.unwrap_or(false),
            }),
            None => Err(Error::InvalidArgument {
                detail: format!("invalid mode: {mode:?}"),
            }),
        }
    }

    pub fn readable(&self) -> bool {
        self.op == ModeOp::Read || self.update
    }

    pub fn writable(&self) -> bool {
        self.op != ModeOp::Read || self.update
    }

    /// The binary random-access mode string the full-object handlers take.
    pub fn handler_mode(&self) -> &'static str {
        match (self.op, self.update) {
            (ModeOp::Read, false) => "rb",
            (ModeOp::Read, true) => "rb+",
            (ModeOp::Write | ModeOp::Exclusive, false) => "wb",
            (ModeOp::Write | ModeOp::Exclusive, true) => "wb+",
            (ModeOp::Append, false) => "ab",
            (ModeOp::Append, true) => "ab+",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderStyle {
    #[default]
    Prefetch,
    ShareCache,
    Pipe,
    Cached,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterStyle {
    #[default]
    Buffered,
    Pipe,
    Memory,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub reader_style: ReaderStyle,
    pub writer_style: WriterStyle,
    pub block_size: Option<u64>,
    pub max_buffer_size: Option<u64>,
    pub block_forward: Option<usize>,
    pub max_workers: Option<usize>,
    pub atomic: bool,
    pub cache_path: Option<PathBuf>,
    pub share_cache_key: Option<String>,
    pub join_thread: bool,
    pub followlinks: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            reader_style: ReaderStyle::default(),
            writer_style: WriterStyle::default(),
            block_size: None,
            max_buffer_size: None,
            block_forward: None,
            max_workers: None,
            atomic: false,
            cache_path: None,
            share_cache_key: None,
            join_thread: true,
            followlinks: false,
        }
    }
}

/// The per-backend operation table. Unsupported operations keep their
/// defaults and fail with [`Error::Unsupported`].
pub trait PathOps: Send + Sync {
    fn protocol(&self) -> &'static str;
    /// Canonical path string including the protocol.
    fn as_str(&self) -> &str;

    fn stat(&self, follow_symlinks: bool) -> Result<StatResult>;

    fn exists(&self, followlinks: bool) -> Result<bool>;

    fn is_dir(&self) -> Result<bool>;

    fn is_file(&self) -> Result<bool>;

    fn is_symlink(&self) -> Result<bool> {
        Ok(false)
    }

    fn listdir(&self) -> Result<Vec<String>> {
        Err(Error::unsupported(self.as_str(), "listdir"))
    }

    fn scandir(&self) -> Result<EntryIter> {
        Err(Error::unsupported(self.as_str(), "scandir"))
    }

    /// Recursively yield file entries below this path.
    fn scan(&self, _missing_ok: bool, _followlinks: bool) -> Result<EntryIter> {
        Err(Error::unsupported(self.as_str(), "scan"))
    }

    fn walk(&self) -> Result<WalkIter> {
        Err(Error::unsupported(self.as_str(), "walk"))
    }

    /// Treat this path as a glob pattern and yield matches.
    fn glob(&self, _recursive: bool, _missing_ok: bool) -> Result<EntryIter> {
        Err(Error::unsupported(self.as_str(), "glob"))
    }

    fn remove(&self, _missing_ok: bool) -> Result<()> {
        Err(Error::unsupported(self.as_str(), "remove"))
    }

    fn mkdir(&self, _exist_ok: bool) -> Result<()> {
        Err(Error::unsupported(self.as_str(), "mkdir"))
    }

    /// Rename onto `dst`, a path of the same protocol.
    fn rename(&self, _dst: &str) -> Result<()> {
        Err(Error::unsupported(self.as_str(), "rename"))
    }

    /// Backend-native single-file copy onto `dst` (same protocol), e.g. an
    /// S3 server-side copy.
    fn copy_native(&self, _dst: &str) -> Result<()> {
        Err(Error::unsupported(self.as_str(), "copy"))
    }

    /// Create this path as a symlink pointing at `target`.
    fn symlink(&self, _target: &str) -> Result<()> {
        Err(Error::unsupported(self.as_str(), "symlink"))
    }

    fn readlink(&self) -> Result<String> {
        Err(Error::unsupported(self.as_str(), "readlink"))
    }

    fn md5(&self) -> Result<String> {
        Err(Error::unsupported(self.as_str(), "md5"))
    }

    fn touch(&self) -> Result<()> {
        Err(Error::unsupported(self.as_str(), "touch"))
    }

    /// Mirror access/modification times, for copies that preserve them.
    fn set_times(&self, _atime: f64, _mtime: f64) -> Result<()> {
        Err(Error::unsupported(self.as_str(), "utime"))
    }

    fn open(&self, mode: &OpenMode, options: &OpenOptions) -> Result<Box<dyn FileLike>>;
}

pub type PathFactory = fn(String, Option<String>) -> Result<Arc<dyn PathOps>>;

fn registry() -> &'static scc::HashMap<String, PathFactory> {
    static REGISTRY: OnceLock<scc::HashMap<String, PathFactory>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let table: scc::HashMap<String, PathFactory> = scc::HashMap::new();
        let defaults: [(&str, PathFactory); 5] = [
            ("fs", crate::fs::make_path),
            ("s3", crate::s3::make_path),
            ("http", crate::http::make_path),
            ("https", crate::http::make_path),
            ("stdio", crate::stdio::make_path),
        ];
        for (name, factory) in defaults {
            let _ = table.insert(name.to_string(), factory);
        }
        table
    })
}

/// Register a backend for a new protocol name.
pub fn register_protocol(name: &str, factory: PathFactory) -> Result<()> {
    if registry().insert(name.to_string(), factory).is_err() {
        return Err(Error::already_exists(format!("protocol: {name}")));
    }
    Ok(())
}

/// Split a path into `(protocol, profile, rest)`.
///
/// `s3+research://bucket/key` selects the `research` credentials profile; a
/// path without a scheme is a filesystem path.
fn extract_protocol(path: &str) -> Result<(String, Option<String>, String)> {
    let Some(at) = path.find("://") else {
        return Ok(("fs".to_string(), None, path.to_string()));
    };
    let scheme = &path[..at];
    if scheme == "fs" {
        // fs://ABS_PATH is the explicit spelling of a local path
        return Ok(("fs".to_string(), None, path[at + 3..].to_string()));
    }
    if scheme
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && c != '+' && c != '-')
    {
        return Ok(("fs".to_string(), None, path.to_string()));
    }
    match scheme.split_once('+') {
        Some((protocol, profile)) if !profile.is_empty() => Ok((
            protocol.to_string(),
            Some(profile.to_string()),
            path.to_string(),
        )),
        _ => Ok((scheme.to_string(), None, path.to_string())),
    }
}

/// A parsed path bound to its backend.
#[derive(Clone)]
pub struct AnyPath {
    protocol: String,
    profile: Option<String>,
    raw: String,
    ops: Arc<dyn PathOps>,
}

impl AnyPath {
    pub fn new(path: impl AsRef<str>) -> Result<AnyPath> {
        let raw = path.as_ref().to_string();
        let (protocol, profile, rest) = extract_protocol(&raw)?;
        let factory = registry()
            .read(&protocol, |_, factory| *factory)
            .ok_or_else(|| Error::unsupported(raw.clone(), format!("protocol: {protocol}")))?;
        let ops = factory(rest, profile.clone())?;
        Ok(AnyPath {
            protocol,
            profile,
            raw,
            ops,
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Canonical path string, including the protocol.
    pub fn as_str(&self) -> &str {
        self.ops.as_str()
    }

    /// Final path component.
    pub fn name(&self) -> &str {
        let trimmed = self.as_str().trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }

    fn normalized(&self) -> &str {
        let s = self.ops.as_str();
        let stripped = s.trim_end_matches('/');
        if stripped.is_empty() {
            s
        } else {
            stripped
        }
    }

    /// Join path components. URI backends ignore absolute roots on the
    /// right-hand side; filesystem paths keep OS semantics.
    pub fn join(&self, parts: &[&str]) -> Result<AnyPath> {
        if self.protocol == "fs" {
            let mut path = PathBuf::from(&self.raw);
            for part in parts {
                path.push(part);
            }
            return AnyPath::new(path.to_string_lossy().as_ref());
        }
        let mut joined = self.raw.trim_end_matches('/').to_string();
        for part in parts {
            joined.push('/');
            joined.push_str(part.trim_start_matches('/'));
        }
        AnyPath::new(&joined)
    }

    pub fn stat(&self, follow_symlinks: bool) -> Result<StatResult> {
        self.ops.stat(follow_symlinks)
    }

    pub fn exists(&self, followlinks: bool) -> Result<bool> {
        self.ops.exists(followlinks)
    }

    pub fn is_dir(&self) -> Result<bool> {
        self.ops.is_dir()
    }

    pub fn is_file(&self) -> Result<bool> {
        self.ops.is_file()
    }

    pub fn is_symlink(&self) -> Result<bool> {
        self.ops.is_symlink()
    }

    pub fn listdir(&self) -> Result<Vec<String>> {
        self.ops.listdir()
    }

    pub fn scandir(&self) -> Result<EntryIter> {
        self.ops.scandir()
    }

    pub fn scan(&self, missing_ok: bool, followlinks: bool) -> Result<EntryIter> {
        self.ops.scan(missing_ok, followlinks)
    }

    pub fn walk(&self) -> Result<WalkIter> {
        self.ops.walk()
    }

    pub fn glob_entries(&self, recursive: bool, missing_ok: bool) -> Result<EntryIter> {
        self.ops.glob(recursive, missing_ok)
    }

    pub fn remove(&self, missing_ok: bool) -> Result<()> {
        self.ops.remove(missing_ok)
    }

    pub fn mkdir(&self, exist_ok: bool) -> Result<()> {
        self.ops.mkdir(exist_ok)
    }

    pub fn rename(&self, dst: &AnyPath) -> Result<()> {
        if self.protocol != dst.protocol {
            return Err(Error::unsupported(
                self.as_str(),
                format!("rename across protocols: {} -> {}", self.protocol, dst.protocol),
            ));
        }
        self.ops.rename(dst.as_str())
    }

    pub fn copy_native(&self, dst: &AnyPath) -> Result<()> {
        if self.protocol != dst.protocol {
            return Err(Error::unsupported(
                self.as_str(),
                format!("copy across protocols: {} -> {}", self.protocol, dst.protocol),
            ));
        }
        self.ops.copy_native(dst.as_str())
    }

    pub fn symlink(&self, target: &AnyPath) -> Result<()> {
        self.ops.symlink(target.as_str())
    }

    pub fn readlink(&self) -> Result<String> {
        self.ops.readlink()
    }

    pub fn md5(&self) -> Result<String> {
        self.ops.md5()
    }

    pub fn touch(&self) -> Result<()> {
        self.ops.touch()
    }

    pub fn set_times(&self, atime: f64, mtime: f64) -> Result<()> {
        self.ops.set_times(atime, mtime)
    }

    /// Open a stream. Mode follows POSIX `r|w|a|x` with optional `+` and
    /// `b|t`; text modes are byte-transparent.
    pub fn open(&self, mode: &str, options: &OpenOptions) -> Result<Box<dyn FileLike>> {
        let mode = OpenMode::parse(mode)?;
        if mode.op == ModeOp::Exclusive && self.exists(options.followlinks)? {
            return Err(Error::already_exists(self.as_str()));
        }
        self.ops.open(&mode, options)
    }

    /// Read the whole object.
    pub fn load(&self) -> Result<Vec<u8>> {
        let mut handle = self.open("rb", &OpenOptions::default())?;
        let data = handle.read(None)?;
        handle.close()?;
        Ok(data)
    }

    /// Read the byte range `[start, stop)`; `stop: None` reads to the end.
    pub fn read_content(&self, start: u64, stop: Option<u64>) -> Result<Vec<u8>> {
        let mut handle = self.open("rb", &OpenOptions::default())?;
        handle.seek(std::io::SeekFrom::Start(start))?;
        let data = match stop {
            Some(stop) => handle.read(Some(stop.saturating_sub(start) as usize))?,
            None => handle.read(None)?,
        };
        handle.close()?;
        Ok(data)
    }

    /// Replace the object with `data`.
    pub fn save(&self, data: &[u8]) -> Result<()> {
        let mut handle = self.open("wb", &OpenOptions::default())?;
        handle.write(data)?;
        handle.close()
    }
}

impl PartialEq for AnyPath {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.profile == other.profile
            && self.normalized() == other.normalized()
    }
}

impl Eq for AnyPath {}

impl std::fmt::Debug for AnyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyPath")
            .field("protocol", &self.protocol)
            .field("path", &self.as_str())
            .finish()
    }
}

impl std::fmt::Display for AnyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expand a possibly-braced pattern and glob every expansion, grouped by
/// backend.
pub fn glob(pattern: &str, recursive: bool, missing_ok: bool) -> Result<EntryIter> {
    let mut iters = Vec::new();
    for expanded in crate::glob::ungloblize(pattern) {
        iters.push(AnyPath::new(&expanded)?.glob_entries(recursive, true)?);
    }
    let chained = iters.into_iter().flatten();
    Ok(crate::missing_ok_iter(
        Box::new(chained),
        missing_ok,
        Error::not_found(pattern),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_extraction() {
        let (protocol, profile, rest) = extract_protocol("s3://bucket/key").unwrap();
        assert_eq!(protocol, "s3");
        assert_eq!(profile, None);
        assert_eq!(rest, "s3://bucket/key");

        let (protocol, profile, _rest) = extract_protocol("s3+research://bucket/key").unwrap();
        assert_eq!(protocol, "s3");
        assert_eq!(profile.as_deref(), Some("research"));

        let (protocol, _profile, rest) = extract_protocol("/var/log/syslog").unwrap();
        assert_eq!(protocol, "fs");
        assert_eq!(rest, "/var/log/syslog");

        let (protocol, _profile, rest) = extract_protocol("fs:///var/data").unwrap();
        assert_eq!(protocol, "fs");
        assert_eq!(rest, "/var/data");
    }

    #[test]
    fn open_modes() {
        let mode = OpenMode::parse("rb").unwrap();
        assert!(mode.readable() && !mode.writable() && mode.binary);

        let mode = OpenMode::parse("w+").unwrap();
        assert!(mode.readable() && mode.writable() && !mode.binary);
        assert_eq!(mode.handler_mode(), "wb+");

        let mode = OpenMode::parse("xb").unwrap();
        assert_eq!(mode.op, ModeOp::Exclusive);

        assert!(OpenMode::parse("rw").is_err());
        assert!(OpenMode::parse("").is_err());
        assert!(OpenMode::parse("bb").is_err());
    }

    #[test]
    fn uri_join_ignores_absolute_right_hand_sides() {
        let base = AnyPath::new("s3://bucket/dir").unwrap();
        let joined = base.join(&["/sub", "file.txt"]).unwrap();
        assert_eq!(joined.as_str(), "s3://bucket/dir/sub/file.txt");
    }

    #[test]
    fn load_save_and_ranged_read_via_the_dispatcher() {
        crate::s3::testing::global_mock().create_bucket("path-io");
        let path = AnyPath::new("s3://path-io/blob").unwrap();
        path.save(b"0123456789").unwrap();
        assert_eq!(path.load().unwrap(), b"0123456789");
        assert_eq!(path.read_content(2, Some(6)).unwrap(), b"2345");
        assert_eq!(path.read_content(5, None).unwrap(), b"56789");
        assert!(path.exists(false).unwrap());
        assert_eq!(path.name(), "blob");
    }

    #[test]
    fn unknown_protocols_are_refused() {
        let result = AnyPath::new("gopher://host/doc");
        assert!(matches!(result, Err(Error::Unsupported { .. })));
    }

    #[test]
    fn equality_is_by_protocol_and_normalized_path() {
        let a = AnyPath::new("s3://bucket/dir/").unwrap();
        let b = AnyPath::new("s3://bucket/dir").unwrap();
        assert_eq!(a, b);

        let c = AnyPath::new("/tmp/dir").unwrap();
        assert_ne!(b, c);
    }
}
