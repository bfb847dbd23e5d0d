//! S3-compatible object storage backend: path operations, the streaming
//! glob engine and server-side concat.
use crate::{
    client::{ListPage, ObjectClient},
    config::DEFAULT_MAX_KEYS,
    path::{
        EntryIter, FileEntry, ModeOp, OpenMode, OpenOptions, PathOps, ReaderStyle, StatResult,
        WalkIter, WriterStyle,
    },
    stream::{
        pool::{block_on, TaskPool},
        BufferedWriter, CachedHandler, FileLike, LimitedSeekableWriter, MemoryHandler, PipeReader,
        PipeWriter, PrefetchReader, RangeSource, ReaderOptions, ShareCacheReader, WriterOptions,
        MIN_PART_SIZE,
    },
    Error, Result,
};
use bytes::Bytes;
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, OnceLock},
};

pub mod client;
pub use client::{get_s3_client, S3Client, S3Profile};

pub(crate) fn make_path(raw: String, profile: Option<String>) -> Result<Arc<dyn PathOps>> {
    Ok(Arc::new(S3Path::new(raw, profile)?))
}

/// Split `s3://bucket/key` (or `s3+profile://…`) into bucket and key. The
/// bucket portion may still contain glob magic.
fn parse_s3_url(url: &str) -> Result<(String, String)> {
    let rest = match url.find("://") {
        Some(at) => &url[at + 3..],
        None => url,
    };
    match rest.split_once('/') {
        Some((bucket, key)) => Ok((bucket.to_string(), key.to_string())),
        None => Ok((rest.to_string(), String::new())),
    }
}

/// Like [`parse_s3_url`], but a `/` inside a brace group does not split.
fn parse_s3_url_ignore_brace(url: &str) -> (String, String) {
    let rest = match url.find("://") {
        Some(at) => &url[at + 3..],
        None => url,
    };
    let mut depth = 0usize;
    for (at, c) in rest.char_indices() {
        match c {
            '{' => depth += 1,
            '}' if depth > 0 => depth -= 1,
            '/' if depth == 0 => {
                return (rest[..at].to_string(), rest[at + 1..].to_string());
            }
            _ => {}
        }
    }
    (rest.to_string(), String::new())
}

pub struct S3Path {
    raw: String,
    bucket: String,
    key: String,
    profile: Option<String>,
    client: OnceLock<Arc<dyn ObjectClient>>,
}

impl S3Path {
    pub fn new(path: impl Into<String>, profile: Option<String>) -> Result<S3Path> {
        let raw = path.into();
        let (bucket, key) = parse_s3_url(&raw)?;
        Ok(S3Path {
            raw,
            bucket,
            key,
            profile,
            client: OnceLock::new(),
        })
    }

    /// Bind the path to an explicit client instead of the memoized
    /// environment one.
    pub fn with_client(path: impl Into<String>, client: Arc<dyn ObjectClient>) -> Result<S3Path> {
        let parsed = S3Path::new(path, None)?;
        let _ = parsed.client.set(client);
        Ok(parsed)
    }

    fn client(&self) -> Result<Arc<dyn ObjectClient>> {
        if let Some(client) = self.client.get() {
            return Ok(client.clone());
        }
        let client = self.default_client()?;
        let _ = self.client.set(client.clone());
        Ok(client)
    }

    #[cfg(not(any(test, feature = "test")))]
    fn default_client(&self) -> Result<Arc<dyn ObjectClient>> {
        get_s3_client(self.profile.as_deref())
    }

    // with the test feature on, paths that were not bound to an explicit
    // client resolve to the process-wide in-memory store
    #[cfg(any(test, feature = "test"))]
    fn default_client(&self) -> Result<Arc<dyn ObjectClient>> {
        Ok(testing::global_client())
    }

    fn scheme(&self) -> String {
        match &self.profile {
            Some(profile) => format!("s3+{profile}"),
            None => "s3".to_string(),
        }
    }

    fn url_of(&self, key: &str) -> String {
        format!("{}://{}/{key}", self.scheme(), self.bucket)
    }

    fn dir_prefix(&self) -> String {
        if self.key.is_empty() || self.key.ends_with('/') {
            self.key.clone()
        } else {
            format!("{}/", self.key)
        }
    }

    fn child(&self, key: String) -> Result<S3Path> {
        let path = S3Path::new(self.url_of(&key), self.profile.clone())?;
        if let Some(client) = self.client.get() {
            let _ = path.client.set(client.clone());
        }
        Ok(path)
    }

    fn require_bucket(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(Error::BucketNotFound {
                path: self.raw.clone(),
            });
        }
        Ok(())
    }

    fn bucket_exists(&self) -> Result<bool> {
        match self
            .client()?
            .list_objects_v2(&self.bucket, "", None, None, 1)
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Stream every object under the directory prefix.
    fn list_recursive(&self) -> Result<Vec<FileEntry>> {
        let client = self.client()?;
        let prefix = self.dir_prefix();
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = client.list_objects_v2(
                &self.bucket,
                &prefix,
                None,
                token.as_deref(),
                DEFAULT_MAX_KEYS,
            )?;
            for content in &page.contents {
                entries.push(self.entry_of_object(content));
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    fn entry_of_object(&self, content: &crate::client::ObjectEntry) -> FileEntry {
        let name = content
            .key
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&content.key)
            .to_string();
        let mut stat = StatResult {
            size: content.size,
            mtime: content.mtime.unwrap_or(0.0),
            ctime: content.mtime.unwrap_or(0.0),
            is_dir: false,
            is_link: false,
            extra: Default::default(),
        };
        if let Some(etag) = &content.etag {
            stat.extra.insert("etag".to_string(), etag.clone());
        }
        FileEntry {
            name,
            path: self.url_of(&content.key),
            stat,
        }
    }

    fn dir_entry(&self, key_prefix: &str) -> FileEntry {
        let trimmed = key_prefix.trim_end_matches('/');
        FileEntry {
            name: trimmed.rsplit('/').next().unwrap_or(trimmed).to_string(),
            path: self.url_of(trimmed),
            stat: StatResult::directory(),
        }
    }
}

impl PathOps for S3Path {
    fn protocol(&self) -> &'static str {
        "s3"
    }

    fn as_str(&self) -> &str {
        &self.raw
    }

    fn stat(&self, _follow_symlinks: bool) -> Result<StatResult> {
        self.require_bucket()?;
        let client = self.client()?;
        if !self.key.is_empty() {
            match client.head_object(&self.bucket, &self.key) {
                Ok(head) => {
                    let mut stat = StatResult {
                        size: head.size,
                        mtime: head.mtime.unwrap_or(0.0),
                        ctime: head.mtime.unwrap_or(0.0),
                        is_dir: false,
                        is_link: false,
                        extra: head.extra,
                    };
                    if let Some(etag) = head.etag {
                        stat.extra.insert("etag".to_string(), etag);
                    }
                    return Ok(stat);
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        // aggregate directory stat: total size, newest mtime
        let entries = self.list_recursive()?;
        if entries.is_empty() && !self.is_dir()? {
            return Err(Error::not_found(self.raw.clone()));
        }
        let mut stat = StatResult::directory();
        for entry in entries {
            stat.size += entry.stat.size;
            stat.mtime = stat.mtime.max(entry.stat.mtime);
        }
        Ok(stat)
    }

    fn exists(&self, _followlinks: bool) -> Result<bool> {
        if self.key.is_empty() {
            return self.bucket_exists();
        }
        Ok(self.is_file()? || self.is_dir()?)
    }

    fn is_dir(&self) -> Result<bool> {
        self.require_bucket()?;
        if self.key.is_empty() {
            return self.bucket_exists();
        }
        // a permission failure on listing propagates; only missing
        // bucket/key map to false
        match self.client()?.list_objects_v2(
            &self.bucket,
            &self.dir_prefix(),
            Some("/"),
            None,
            1,
        ) {
            Ok(page) => Ok(!page.contents.is_empty() || !page.common_prefixes.is_empty()),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn is_file(&self) -> Result<bool> {
        if self.key.is_empty() {
            return Ok(false);
        }
        match self.client()?.head_object(&self.bucket, &self.key) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn listdir(&self) -> Result<Vec<String>> {
        let entries = self.scandir()?;
        let mut names: Vec<String> = entries
            .map(|entry| entry.map(|entry| entry.name))
            .collect::<Result<_>>()?;
        names.sort();
        Ok(names)
    }

    fn scandir(&self) -> Result<EntryIter> {
        self.require_bucket()?;
        if !self.key.is_empty() && self.is_file()? {
            return Err(Error::NotADirectory {
                path: self.raw.clone(),
            });
        }
        let client = self.client()?;
        let prefix = self.dir_prefix();

        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = client.list_objects_v2(
                &self.bucket,
                &prefix,
                Some("/"),
                token.as_deref(),
                DEFAULT_MAX_KEYS,
            )?;
            for common in &page.common_prefixes {
                entries.push(Ok(self.dir_entry(common)));
            }
            for content in &page.contents {
                if content.key == prefix {
                    // the directory marker itself
                    continue;
                }
                entries.push(Ok(self.entry_of_object(content)));
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        if entries.is_empty() && !self.exists(false)? {
            return Err(Error::not_found(self.raw.clone()));
        }
        entries.sort_by(|a, b| match (a, b) {
            (Ok(a), Ok(b)) => a.name.cmp(&b.name),
            _ => std::cmp::Ordering::Equal,
        });
        Ok(Box::new(entries.into_iter()))
    }

    fn scan(&self, missing_ok: bool, _followlinks: bool) -> Result<EntryIter> {
        self.require_bucket()?;
        let mut entries = Vec::new();
        if !self.key.is_empty() && self.is_file()? {
            let head = self.client()?.head_object(&self.bucket, &self.key)?;
            entries.push(Ok(self.entry_of_object(&crate::client::ObjectEntry {
                key: self.key.clone(),
                size: head.size,
                mtime: head.mtime,
                etag: head.etag,
            })));
        } else {
            for entry in self.list_recursive()? {
                entries.push(Ok(entry));
            }
        }
        Ok(crate::missing_ok_iter(
            Box::new(entries.into_iter()),
            missing_ok,
            Error::not_found(self.raw.clone()),
        ))
    }

    fn walk(&self) -> Result<WalkIter> {
        self.require_bucket()?;

        struct S3Walker {
            path: S3Path,
            stack: VecDeque<String>,
        }

        impl Iterator for S3Walker {
            type Item = Result<(String, Vec<String>, Vec<String>)>;

            fn next(&mut self) -> Option<Self::Item> {
                let prefix = self.stack.pop_front()?;
                let client = match self.path.client() {
                    Ok(client) => client,
                    Err(err) => return Some(Err(err)),
                };

                let mut dirs = Vec::new();
                let mut files = Vec::new();
                let mut token: Option<String> = None;
                loop {
                    let page = match client.list_objects_v2(
                        &self.path.bucket,
                        &prefix,
                        Some("/"),
                        token.as_deref(),
                        DEFAULT_MAX_KEYS,
                    ) {
                        Ok(page) => page,
                        Err(err) => return Some(Err(err)),
                    };
                    for common in &page.common_prefixes {
                        let name = common[prefix.len()..].trim_end_matches('/').to_string();
                        dirs.push(name);
                    }
                    for content in &page.contents {
                        if content.key == prefix {
                            continue;
                        }
                        files.push(content.key[prefix.len()..].to_string());
                    }
                    match page.next_token {
                        Some(next) => token = Some(next),
                        None => break,
                    }
                }
                dirs.sort();
                files.sort();
                for dir in dirs.iter().rev() {
                    self.stack.push_front(format!("{prefix}{dir}/"));
                }
                let root = self
                    .path
                    .url_of(prefix.trim_end_matches('/'));
                Some(Ok((root, dirs, files)))
            }
        }

        Ok(Box::new(S3Walker {
            path: self.child(self.key.clone())?,
            stack: VecDeque::from([self.dir_prefix()]),
        }))
    }

    fn glob(&self, recursive: bool, missing_ok: bool) -> Result<EntryIter> {
        glob_entries(self, recursive, missing_ok)
    }

    fn remove(&self, missing_ok: bool) -> Result<()> {
        self.require_bucket()?;
        if self.key.is_empty() {
            return Err(Error::unsupported(self.raw.clone(), "remove bucket"));
        }
        let client = self.client()?;
        if self.is_file()? {
            return client.delete_object(&self.bucket, &self.key);
        }
        let entries = self.list_recursive()?;
        if entries.is_empty() {
            if missing_ok {
                return Ok(());
            }
            return Err(Error::not_found(self.raw.clone()));
        }
        for entry in entries {
            let (_, key) = parse_s3_url(&entry.path)?;
            client.delete_object(&self.bucket, &key)?;
        }
        Ok(())
    }

    fn mkdir(&self, exist_ok: bool) -> Result<()> {
        self.require_bucket()?;
        if !self.bucket_exists()? {
            return Err(Error::BucketNotFound {
                path: self.raw.clone(),
            });
        }
        if self.exists(false)? && !exist_ok {
            return Err(Error::already_exists(self.raw.clone()));
        }
        // object stores have no directory objects; an existing bucket is all
        // a prefix needs
        Ok(())
    }

    fn rename(&self, dst: &str) -> Result<()> {
        let client = self.client()?;
        let (dst_bucket, dst_key) = parse_s3_url(dst)?;
        if self.is_file()? {
            client.copy_object(&self.bucket, &self.key, &dst_bucket, &dst_key)?;
            return client.delete_object(&self.bucket, &self.key);
        }

        let prefix = self.dir_prefix();
        let dst_prefix = if dst_key.is_empty() || dst_key.ends_with('/') {
            dst_key
        } else {
            format!("{dst_key}/")
        };
        let entries = self.list_recursive()?;
        if entries.is_empty() {
            return Err(Error::not_found(self.raw.clone()));
        }
        for entry in entries {
            let (_, key) = parse_s3_url(&entry.path)?;
            let suffix = &key[prefix.len()..];
            client.copy_object(
                &self.bucket,
                &key,
                &dst_bucket,
                &format!("{dst_prefix}{suffix}"),
            )?;
            client.delete_object(&self.bucket, &key)?;
        }
        Ok(())
    }

    fn copy_native(&self, dst: &str) -> Result<()> {
        if !self.is_file()? {
            return Err(Error::IsADirectory {
                path: self.raw.clone(),
            });
        }
        let (dst_bucket, dst_key) = parse_s3_url(dst)?;
        self.client()?
            .copy_object(&self.bucket, &self.key, &dst_bucket, &dst_key)
    }

    fn md5(&self) -> Result<String> {
        self.require_bucket()?;
        if !self.key.is_empty() && self.is_file()? {
            let head = self.client()?.head_object(&self.bucket, &self.key)?;
            return head
                .etag
                .ok_or_else(|| Error::unsupported(self.raw.clone(), "md5"));
        }
        // directory: fold child hashes in name order
        use md5::{Digest, Md5};
        let mut entries = self.list_recursive()?;
        if entries.is_empty() {
            return Err(Error::not_found(self.raw.clone()));
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let mut hasher = Md5::new();
        for entry in entries {
            if let Some(etag) = entry.stat.extra.get("etag") {
                hasher.update(etag.as_bytes());
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn touch(&self) -> Result<()> {
        self.require_bucket()?;
        self.client()?
            .put_object(&self.bucket, &self.key, Bytes::new())
    }

    fn open(&self, mode: &OpenMode, options: &OpenOptions) -> Result<Box<dyn FileLike>> {
        self.require_bucket()?;
        if self.key.is_empty() {
            return Err(Error::IsADirectory {
                path: self.raw.clone(),
            });
        }
        let client = self.client()?;

        // random access needs the full-object handlers
        if mode.update || mode.op == ModeOp::Append || matches!(
            (mode.op, options.reader_style),
            (ModeOp::Read, ReaderStyle::Cached | ReaderStyle::Memory)
        ) || matches!(
            (mode.op, options.writer_style),
            (ModeOp::Write | ModeOp::Exclusive, WriterStyle::Memory)
        ) {
            if options.cache_path.is_some() || options.reader_style == ReaderStyle::Cached {
                return Ok(Box::new(CachedHandler::new(
                    client,
                    self.bucket.clone(),
                    self.key.clone(),
                    self.raw.clone(),
                    mode.handler_mode(),
                    options.cache_path.clone(),
                )?));
            }
            return Ok(Box::new(MemoryHandler::new(
                client,
                self.bucket.clone(),
                self.key.clone(),
                self.raw.clone(),
                mode.handler_mode(),
            )?));
        }

        match mode.op {
            ModeOp::Read => {
                if options.reader_style == ReaderStyle::Pipe {
                    return Ok(Box::new(PipeReader::new(
                        client,
                        self.bucket.clone(),
                        self.key.clone(),
                        self.raw.clone(),
                        options.join_thread,
                    )?));
                }
                let source = Arc::new(S3RangeSource::new(
                    client,
                    self.bucket.clone(),
                    self.key.clone(),
                    self.raw.clone(),
                )?);
                let reader_options = ReaderOptions {
                    block_size: options
                        .block_size
                        .unwrap_or(crate::config::config().reader_block_size),
                    max_buffer_size: options
                        .max_buffer_size
                        .unwrap_or(crate::config::config().reader_max_buffer_size),
                    block_forward: options.block_forward,
                    max_workers: options.max_workers,
                };
                if options.reader_style == ReaderStyle::ShareCache {
                    let cache_key = options.share_cache_key.as_deref().unwrap_or("lru");
                    return Ok(Box::new(ShareCacheReader::new(
                        source,
                        cache_key,
                        reader_options,
                    )?));
                }
                Ok(Box::new(PrefetchReader::new(source, reader_options)?))
            }
            ModeOp::Write | ModeOp::Exclusive => {
                if options.writer_style == WriterStyle::Pipe {
                    return Ok(Box::new(PipeWriter::new(
                        client,
                        self.bucket.clone(),
                        self.key.clone(),
                        self.raw.clone(),
                        options.join_thread,
                    )?));
                }
                let writer_options = WriterOptions {
                    block_size: options
                        .block_size
                        .unwrap_or(crate::config::config().writer_block_size),
                    max_buffer_size: options
                        .max_buffer_size
                        .unwrap_or(crate::config::config().writer_max_buffer_size),
                    block_autoscale: None,
                    max_workers: options.max_workers,
                    atomic: options.atomic,
                };
                Ok(Box::new(BufferedWriter::new(
                    client,
                    self.bucket.clone(),
                    self.key.clone(),
                    self.raw.clone(),
                    writer_options,
                )?))
            }
            ModeOp::Append => unreachable!("append handled above"),
        }
    }
}

/// Range source over one S3 object, pinned to the ETag observed at open.
pub struct S3RangeSource {
    client: Arc<dyn ObjectClient>,
    bucket: String,
    key: String,
    name: String,
    size: u64,
    etag: Option<String>,
}

impl S3RangeSource {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        bucket: String,
        key: String,
        name: String,
    ) -> Result<S3RangeSource> {
        let head = client.head_object(&bucket, &key)?;
        Ok(S3RangeSource {
            client,
            bucket,
            key,
            name,
            size: head.size,
            etag: head.etag,
        })
    }
}

impl RangeSource for S3RangeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_size(&self) -> u64 {
        self.size
    }

    fn fetch(&self, start: u64, end: u64) -> Result<Bytes> {
        let (body, etag) = self
            .client
            .get_object(&self.bucket, &self.key, Some((start, end)))?;
        if let (Some(before), Some(after)) = (&self.etag, &etag) {
            if before != after {
                return Err(Error::ObjectChanged {
                    path: self.name.clone(),
                    before: before.clone(),
                    after: after.clone(),
                });
            }
        }
        Ok(body)
    }
}

/// Open a limited-seekable writer for header-patching formats.
pub fn open_limited_seekable_writer(
    path: &str,
    options: crate::stream::SeekableWriterOptions,
) -> Result<LimitedSeekableWriter> {
    let profile = path
        .split_once("://")
        .and_then(|(scheme, _)| scheme.split_once('+'))
        .map(|(_, profile)| profile.to_string());
    let path = S3Path::new(path, profile)?;
    path.require_bucket()?;
    LimitedSeekableWriter::new(
        path.client()?,
        path.bucket.clone(),
        path.key.clone(),
        path.raw.clone(),
        options,
    )
}

// ---- glob engine ----

fn is_wildcard_bucket(bucket: &str) -> bool {
    crate::glob::has_magic_ignore_brace(bucket)
}

/// Expand the bucket portion, resolving wildcard buckets against
/// `ListBuckets`.
fn group_by_bucket(path: &S3Path, pattern: &str) -> Result<Vec<String>> {
    let (bucket, key) = parse_s3_url_ignore_brace(pattern);
    if bucket.is_empty() {
        return Err(Error::unsupported(pattern, "glob without a bucket"));
    }
    let scheme = path.scheme();
    let trailing = pattern.ends_with('/');

    let make_url = |bucket: &str, key: &str| {
        if key.is_empty() {
            format!("{scheme}://{bucket}{}", if trailing { "/" } else { "" })
        } else {
            format!("{scheme}://{bucket}/{key}")
        }
    };

    let mut all_buckets: Option<Vec<String>> = None;
    let mut grouped = Vec::new();
    for expanded in crate::glob::ungloblize(&bucket) {
        if is_wildcard_bucket(&expanded) {
            // the wildcard may extend into the key space
            let (bucket_part, path_part) = match expanded.split_once('/') {
                Some((bucket_part, path_part)) => (bucket_part.to_string(), Some(path_part)),
                None => (expanded.clone(), None),
            };
            let regex = crate::glob::translate(
                &crate::glob::collapse_recursive_wildcards(&bucket_part),
                false,
            )?;
            if all_buckets.is_none() {
                all_buckets = Some(path.client()?.list_buckets()?);
            }
            for name in all_buckets.as_deref().unwrap_or(&[]) {
                if regex.is_match(name) {
                    let full_bucket = match path_part {
                        Some(path_part) => format!("{name}/{path_part}"),
                        None => name.clone(),
                    };
                    grouped.push(make_url(&full_bucket, &key));
                }
            }
        } else {
            grouped.push(make_url(&expanded, &key));
        }
    }
    Ok(grouped)
}

/// Expand brace groups in the literal prefix so each expansion lists its own
/// narrow prefix.
fn group_by_prefix(pattern: &str) -> Vec<String> {
    let (_, key) = parse_s3_url_ignore_brace(pattern);
    if key.is_empty() {
        return crate::glob::ungloblize(pattern);
    }
    let (top_dir, magic_part) = crate::glob::split_magic_ignore_brace(pattern);
    if top_dir.is_empty() {
        return vec![magic_part];
    }
    crate::glob::ungloblize(&top_dir)
        .into_iter()
        .map(|prefix| {
            if magic_part.is_empty() {
                prefix
            } else {
                format!("{prefix}/{magic_part}")
            }
        })
        .collect()
}

fn should_recursive(wildcard_part: &str, search_dir: bool) -> bool {
    if wildcard_part.contains("**") {
        return true;
    }
    for expanded in crate::glob::ungloblize(wildcard_part) {
        if expanded.split('/').count() + usize::from(search_dir) >= 2 {
            return true;
        }
    }
    false
}

/// Glob one brace-expanded pattern: list from the literal prefix, match the
/// translated regex, and synthesize unseen ancestor directories.
fn glob_single(path: &S3Path, pattern: &str, recursive: bool) -> Result<Vec<FileEntry>> {
    let pattern = if recursive {
        pattern.to_string()
    } else {
        crate::glob::collapse_recursive_wildcards(pattern)
    };

    let (top_dir, wildcard_part) = crate::glob::split_magic(&pattern);
    let search_dir = wildcard_part.ends_with('/');
    let top = S3Path::new(top_dir.clone(), path.profile.clone())?;
    if let Some(client) = path.client.get() {
        let _ = top.client.set(client.clone());
    }

    if !crate::glob::has_magic(&pattern) {
        // no magic at all: plain existence probes
        let mut out = Vec::new();
        let probe = S3Path::new(pattern.trim_end_matches('/'), path.profile.clone())?;
        if let Some(client) = path.client.get() {
            let _ = probe.client.set(client.clone());
        }
        if probe.is_file()? {
            let head = probe.client()?.head_object(&probe.bucket, &probe.key)?;
            out.push(probe.entry_of_object(&crate::client::ObjectEntry {
                key: probe.key.clone(),
                size: head.size,
                mtime: head.mtime,
                etag: head.etag,
            }));
        }
        if probe.is_dir()? {
            out.push(FileEntry {
                name: probe.key.trim_end_matches('/').rsplit('/').next().unwrap_or("").to_string(),
                path: probe.raw.clone(),
                stat: StatResult::directory(),
            });
        }
        return Ok(out);
    }

    if !top.exists(false)? {
        return Ok(Vec::new());
    }

    let delimiter = if should_recursive(&wildcard_part, search_dir) {
        None
    } else {
        Some("/")
    };
    let regex = crate::glob::translate(&pattern, true)?;
    let client = top.client()?;
    let prefix = top.dir_prefix();

    let top_url = top.raw.trim_end_matches('/').to_string();
    let mut seen_dirs: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    let emit_ancestors =
        |url: &str, out: &mut Vec<FileEntry>, seen_dirs: &mut HashSet<String>| {
            let mut dirname = match url.rfind('/') {
                Some(at) => url[..at].to_string(),
                None => return,
            };
            while !seen_dirs.contains(&dirname) && dirname != top_url && dirname.contains("//") {
                seen_dirs.insert(dirname.clone());
                let candidate = if search_dir {
                    format!("{dirname}/")
                } else {
                    dirname.clone()
                };
                if regex.is_match(&candidate) {
                    out.push(FileEntry {
                        name: dirname.rsplit('/').next().unwrap_or("").to_string(),
                        path: dirname.clone(),
                        stat: StatResult::directory(),
                    });
                }
                dirname = match dirname.rfind('/') {
                    Some(at) => dirname[..at].to_string(),
                    None => break,
                };
            }
        };

    let mut token: Option<String> = None;
    loop {
        let page: ListPage = client.list_objects_v2(
            &top.bucket,
            &prefix,
            delimiter,
            token.as_deref(),
            DEFAULT_MAX_KEYS,
        )?;
        for content in &page.contents {
            let url = top.url_of(&content.key);
            if !search_dir && regex.is_match(&url) {
                out.push(top.entry_of_object(content));
            }
            emit_ancestors(&url, &mut out, &mut seen_dirs);
        }
        for common in &page.common_prefixes {
            let url = top.url_of(common.trim_end_matches('/'));
            emit_ancestors(&format!("{url}/x"), &mut out, &mut seen_dirs);
        }
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(out)
}

fn glob_entries(path: &S3Path, recursive: bool, missing_ok: bool) -> Result<EntryIter> {
    let mut out = Vec::new();
    for bucket_pattern in group_by_bucket(path, &path.raw)? {
        for pattern in group_by_prefix(&bucket_pattern) {
            out.extend(glob_single(path, &pattern, recursive)?);
        }
    }
    Ok(crate::missing_ok_iter(
        Box::new(out.into_iter().map(Ok)),
        missing_ok,
        Error::not_found(path.raw.clone()),
    ))
}

// ---- concat ----

#[derive(Clone)]
struct PartSource {
    bucket: String,
    key: String,
    range: Option<(u64, u64)>,
}

type PartGroup = Vec<PartSource>;

/// Group sources into upload-part-copy batches of at least `block_size`
/// bytes, splitting an oversized head source and coalescing small sources.
fn group_sources_by_block(sources: &[(String, String, u64)], block_size: u64) -> Vec<PartGroup> {
    let mut groups: Vec<PartGroup> = Vec::new();
    let mut current: PartGroup = Vec::new();
    let mut current_size = 0u64;

    for (bucket, key, size) in sources {
        let source = PartSource {
            bucket: bucket.clone(),
            key: key.clone(),
            range: None,
        };
        let size = *size;
        if size == 0 {
            continue;
        }
        if size >= block_size {
            if groups.is_empty() {
                if current_size + size > 2 * block_size {
                    // split this source so the first group reaches the
                    // minimum part size
                    let lack = block_size - current_size;
                    current.push(PartSource {
                        range: Some((0, lack - 1)),
                        ..source.clone()
                    });
                    groups.push(std::mem::take(&mut current));
                    groups.push(vec![PartSource {
                        range: Some((lack, size - 1)),
                        ..source
                    }]);
                } else {
                    current.push(source);
                    groups.push(std::mem::take(&mut current));
                }
            } else {
                let carried = std::mem::take(&mut current);
                if let Some(last) = groups.last_mut() {
                    last.extend(carried);
                }
                groups.push(vec![source]);
            }
            current_size = 0;
        } else {
            current.push(source);
            current_size += size;
            if current_size >= block_size {
                groups.push(std::mem::take(&mut current));
                current_size = 0;
            }
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Concatenate S3 objects into one via server-side part copies.
pub fn concat(sources: &[S3Path], dst: &S3Path, block_size: u64) -> Result<()> {
    dst.require_bucket()?;
    let client = dst.client()?;

    let mut sized = Vec::with_capacity(sources.len());
    for source in sources {
        let head = client.head_object(&source.bucket, &source.key)?;
        sized.push((source.bucket.clone(), source.key.clone(), head.size));
    }

    let groups: Vec<PartGroup> = if block_size == 0 {
        sized
            .iter()
            .map(|(bucket, key, _)| {
                vec![PartSource {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    range: None,
                }]
            })
            .collect()
    } else {
        group_sources_by_block(&sized, block_size.max(MIN_PART_SIZE))
    };
    if groups.is_empty() {
        return client.put_object(&dst.bucket, &dst.key, Bytes::new());
    }

    let upload_id = client.create_multipart_upload(&dst.bucket, &dst.key)?;

    let pool = TaskPool::global();
    let mut handles = Vec::new();
    for (index, group) in groups.into_iter().enumerate() {
        let part_number = (index + 1) as u16;
        let client = client.clone();
        let dst_bucket = dst.bucket.clone();
        let dst_key = dst.key.clone();
        let upload_id = upload_id.clone();

        handles.push(pool.spawn_blocking(move || -> Result<crate::client::CompletedPart> {
            let etag = if group.len() == 1 {
                let source = &group[0];
                client.upload_part_copy(
                    &dst_bucket,
                    &dst_key,
                    &upload_id,
                    part_number,
                    &source.bucket,
                    &source.key,
                    source.range,
                )?
            } else {
                // coalesce small sources into one buffered part
                let mut body = Vec::new();
                for source in &group {
                    let (bytes, _etag) =
                        client.get_object(&source.bucket, &source.key, source.range)?;
                    body.extend_from_slice(&bytes);
                }
                client.upload_part(
                    &dst_bucket,
                    &dst_key,
                    &upload_id,
                    part_number,
                    Bytes::from(body),
                )?
            };
            Ok(crate::client::CompletedPart { part_number, etag })
        }));
    }

    let mut parts = Vec::with_capacity(handles.len());
    let mut failed = None;
    for handle in handles {
        match block_on(handle) {
            Ok(Ok(part)) => parts.push(part),
            Ok(Err(err)) => failed = Some(err),
            Err(join_err) => {
                failed = Some(Error::unknown(dst.raw.clone(), anyhow::anyhow!(join_err)))
            }
        }
    }
    if let Some(err) = failed {
        let _ = client.abort_multipart_upload(&dst.bucket, &dst.key, &upload_id);
        return Err(err);
    }
    parts.sort_by_key(|part| part.part_number);
    client.complete_multipart_upload(&dst.bucket, &dst.key, &upload_id, &parts)
}

#[cfg(any(test, feature = "test"))]
pub mod testing {
    use super::*;
    use crate::client::test::MockClient;

    /// The process-wide in-memory object store backing unbound `s3://`
    /// paths in tests.
    pub fn global_client() -> Arc<dyn ObjectClient> {
        let client: Arc<dyn ObjectClient> = global_mock().clone();
        client
    }

    pub fn global_mock() -> &'static Arc<MockClient> {
        static MOCK: OnceLock<Arc<MockClient>> = OnceLock::new();
        MOCK.get_or_init(MockClient::shared)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::test::MockClient;

    fn path(client: &Arc<MockClient>, url: &str) -> S3Path {
        S3Path::with_client(url, client.clone()).unwrap()
    }

    fn seeded() -> Arc<MockClient> {
        let client = MockClient::with_buckets(&["b"]);
        client.insert_object("b", "dir/a.txt", &b"aaa"[..]);
        client.insert_object("b", "dir/b.txt", &b"bb"[..]);
        client.insert_object("b", "dir/sub/c.txt", &b"c"[..]);
        client.insert_object("b", "top.bin", &b"tttt"[..]);
        client
    }

    #[test]
    fn stat_files_and_directories() {
        let client = seeded();

        let file = path(&client, "s3://b/dir/a.txt");
        let stat = file.stat(true).unwrap();
        assert_eq!(stat.size, 3);
        assert!(!stat.is_dir);
        assert!(stat.extra.contains_key("etag"));

        let dir = path(&client, "s3://b/dir");
        let stat = dir.stat(true).unwrap();
        assert!(stat.is_dir);
        assert_eq!(stat.size, 6);

        let missing = path(&client, "s3://b/nope");
        assert!(matches!(missing.stat(true), Err(Error::NotFound { .. })));
    }

    #[test]
    fn exists_is_dir_is_file() {
        let client = seeded();

        assert!(path(&client, "s3://b/dir").is_dir().unwrap());
        assert!(!path(&client, "s3://b/dir").is_file().unwrap());
        assert!(path(&client, "s3://b/dir/a.txt").is_file().unwrap());
        assert!(path(&client, "s3://b/dir/a.txt").exists(false).unwrap());
        assert!(path(&client, "s3://b").exists(false).unwrap());
        assert!(!path(&client, "s3://missing/x").exists(false).unwrap());
    }

    #[test]
    fn listdir_merges_prefixes_and_objects() {
        let client = seeded();
        let names = path(&client, "s3://b/dir").listdir().unwrap();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

        let result = path(&client, "s3://b/dir/a.txt").listdir();
        assert!(matches!(result, Err(Error::NotADirectory { .. })));
    }

    #[test]
    fn scan_streams_all_keys_in_order() {
        let client = seeded();
        let keys: Vec<String> = path(&client, "s3://b/dir")
            .scan(false, false)
            .unwrap()
            .map(|entry| entry.unwrap().path)
            .collect();
        assert_eq!(
            keys,
            vec![
                "s3://b/dir/a.txt",
                "s3://b/dir/b.txt",
                "s3://b/dir/sub/c.txt"
            ]
        );

        let mut empty = path(&client, "s3://b/nothing").scan(false, false).unwrap();
        assert!(matches!(empty.next(), Some(Err(Error::NotFound { .. }))));
    }

    #[test]
    fn walk_synthesizes_directory_levels() {
        let client = seeded();
        let triples: Vec<_> = path(&client, "s3://b/dir")
            .walk()
            .unwrap()
            .map(|step| step.unwrap())
            .collect();
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].0, "s3://b/dir");
        assert_eq!(triples[0].1, vec!["sub"]);
        assert_eq!(triples[0].2, vec!["a.txt", "b.txt"]);
        assert_eq!(triples[1].0, "s3://b/dir/sub");
        assert_eq!(triples[1].2, vec!["c.txt"]);
    }

    #[test]
    fn remove_file_and_prefix() {
        let client = seeded();
        path(&client, "s3://b/top.bin").remove(false).unwrap();
        assert!(client.object_bytes("b", "top.bin").is_none());

        path(&client, "s3://b/dir").remove(false).unwrap();
        assert!(client.object_keys("b").is_empty());

        assert!(path(&client, "s3://b/gone").remove(true).is_ok());
        assert!(matches!(
            path(&client, "s3://b/gone").remove(false),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn rename_moves_the_object() {
        let client = seeded();
        path(&client, "s3://b/top.bin")
            .rename("s3://b/moved.bin")
            .unwrap();
        assert!(client.object_bytes("b", "top.bin").is_none());
        assert_eq!(
            client.object_bytes("b", "moved.bin").unwrap().as_ref(),
            b"tttt"
        );
    }

    #[test]
    fn open_styles_round_trip() {
        let client = seeded();
        let options = OpenOptions::default();

        let mut reader = path(&client, "s3://b/dir/a.txt")
            .open(&OpenMode::parse("rb").unwrap(), &options)
            .unwrap();
        assert_eq!(reader.read(None).unwrap(), b"aaa");
        reader.close().unwrap();

        let mut writer = path(&client, "s3://b/new.bin")
            .open(&OpenMode::parse("wb").unwrap(), &options)
            .unwrap();
        writer.write(b"fresh").unwrap();
        writer.close().unwrap();
        assert_eq!(client.object_bytes("b", "new.bin").unwrap().as_ref(), b"fresh");

        let mut appender = path(&client, "s3://b/new.bin")
            .open(&OpenMode::parse("ab").unwrap(), &options)
            .unwrap();
        appender.write(b"-er").unwrap();
        appender.close().unwrap();
        assert_eq!(
            client.object_bytes("b", "new.bin").unwrap().as_ref(),
            b"fresh-er"
        );
    }

    #[test]
    fn reader_detects_object_change() {
        let client = seeded();
        let source = S3RangeSource::new(
            client.clone(),
            "b".to_string(),
            "dir/a.txt".to_string(),
            "s3://b/dir/a.txt".to_string(),
        )
        .unwrap();
        client.insert_object("b", "dir/a.txt", &b"replaced"[..]);
        assert!(matches!(
            source.fetch(0, 2),
            Err(Error::ObjectChanged { .. })
        ));
    }

    #[test]
    fn glob_matches_within_bucket() {
        let client = seeded();
        let entries: Vec<String> = path(&client, "s3://b/dir/*.txt")
            .glob(true, false)
            .unwrap()
            .map(|entry| entry.unwrap().path)
            .collect();
        assert_eq!(entries, vec!["s3://b/dir/a.txt", "s3://b/dir/b.txt"]);
    }

    #[test]
    fn glob_recursive_is_a_superset() {
        let client = seeded();
        let flat: Vec<String> = path(&client, "s3://b/**.txt")
            .glob(false, true)
            .unwrap()
            .map(|entry| entry.unwrap().path)
            .collect();
        let deep: Vec<String> = path(&client, "s3://b/**.txt")
            .glob(true, false)
            .unwrap()
            .map(|entry| entry.unwrap().path)
            .collect();
        for found in &flat {
            assert!(deep.contains(found));
        }
        assert!(deep.contains(&"s3://b/dir/sub/c.txt".to_string()));
    }

    #[test]
    fn glob_with_bucket_wildcard() {
        let client = MockClient::with_buckets(&["a1", "a2", "b1"]);
        client.insert_object("a1", "x/one.txt", &b"1"[..]);
        client.insert_object("a2", "x/two.txt", &b"2"[..]);
        client.insert_object("b1", "x/three.txt", &b"3"[..]);

        let entries: Vec<String> = path(&client, "s3://a*/x/*.txt")
            .glob(true, false)
            .unwrap()
            .map(|entry| entry.unwrap().path)
            .collect();
        assert_eq!(entries, vec!["s3://a1/x/one.txt", "s3://a2/x/two.txt"]);
    }

    #[test]
    fn glob_missing_ok_defers_not_found() {
        let client = seeded();
        let mut strict = path(&client, "s3://b/zzz/*.txt").glob(true, false).unwrap();
        assert!(matches!(strict.next(), Some(Err(Error::NotFound { .. }))));

        let mut relaxed = path(&client, "s3://b/zzz/*.txt").glob(true, true).unwrap();
        assert!(relaxed.next().is_none());
    }

    #[test]
    fn glob_with_braces_fans_out() {
        let client = seeded();
        let entries: Vec<String> = path(&client, "s3://b/dir/{a,b}.txt")
            .glob(true, false)
            .unwrap()
            .map(|entry| entry.unwrap().path)
            .collect();
        assert_eq!(entries, vec!["s3://b/dir/a.txt", "s3://b/dir/b.txt"]);
    }

    #[test]
    fn concat_coalesces_small_sources() {
        let client = MockClient::with_buckets(&["b"]);
        client.insert_object("b", "p1", &b"hello "[..]);
        client.insert_object("b", "p2", &b"concat "[..]);
        client.insert_object("b", "p3", &b"world"[..]);

        let sources = vec![
            path(&client, "s3://b/p1"),
            path(&client, "s3://b/p2"),
            path(&client, "s3://b/p3"),
        ];
        let dst = path(&client, "s3://b/joined");
        concat(&sources, &dst, 8 * 1024 * 1024).unwrap();

        assert_eq!(
            client.object_bytes("b", "joined").unwrap().as_ref(),
            b"hello concat world"
        );
        assert_eq!(client.pending_uploads(), 0);
    }

    #[test]
    fn concat_splits_large_heads_across_parts() {
        const MIB: usize = 1024 * 1024;
        let client = MockClient::with_buckets(&["b"]);
        let big: Vec<u8> = (0..20 * MIB).map(|index| index as u8).collect();
        client.insert_object("b", "small", &b"tiny"[..]);
        client.insert_object("b", "big", big.clone());

        let sources = vec![path(&client, "s3://b/small"), path(&client, "s3://b/big")];
        let dst = path(&client, "s3://b/out");
        concat(&sources, &dst, 8 * MIB as u64).unwrap();

        let stored = client.object_bytes("b", "out").unwrap();
        assert_eq!(stored.len(), 4 + big.len());
        assert_eq!(&stored[..4], b"tiny");
        assert_eq!(&stored[4..], big.as_slice());
    }

    #[test]
    fn source_grouping_respects_the_minimum() {
        let sized: Vec<(String, String, u64)> = vec![
            ("b".into(), "a".into(), 2),
            ("b".into(), "b".into(), 3),
            ("b".into(), "c".into(), 20),
            ("b".into(), "d".into(), 1),
        ];
        let groups = group_sources_by_block(&sized, 8);
        // head group is filled up to the block size by splitting "c"
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[0][2].range, Some((0, 2)));
        assert_eq!(groups[1][0].range, Some((3, 19)));
        assert_eq!(groups[2][0].key, "d");
    }
}
