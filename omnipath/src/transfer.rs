//! Cross-backend copy, sync, move and concat.
//!
//! Copies route through a table keyed by `(src_protocol, dst_protocol)`.
//! Registered entries cover the backend-native fast paths; everything else
//! falls back to a generic stream copy.
use crate::{
    config::config, path::OpenOptions, AnyPath, Error, Result, StatResult,
};
use std::sync::{Arc, OnceLock};

/// Chunk size of the generic stream copy.
const COPY_CHUNK_SIZE: usize = 16 * 1024;
/// Chunk size when one side is object storage.
const REMOTE_CHUNK_SIZE: usize = 8 * 1024 * 1024;

pub type ProgressCallback = dyn Fn(u64) + Send + Sync;

#[derive(Clone)]
pub struct CopyOptions {
    pub followlinks: bool,
    pub overwrite: bool,
    /// Called per chunk with the bytes copied since the last call.
    pub callback: Option<Arc<ProgressCallback>>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            followlinks: false,
            overwrite: true,
            callback: None,
        }
    }
}

type CopyFunc = Arc<dyn Fn(&AnyPath, &AnyPath, &CopyOptions) -> Result<()> + Send + Sync>;

fn copy_table() -> &'static scc::HashMap<(String, String), CopyFunc> {
    static TABLE: OnceLock<scc::HashMap<(String, String), CopyFunc>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let table: scc::HashMap<(String, String), CopyFunc> = scc::HashMap::new();
        let defaults: [(&str, &str, CopyFunc); 4] = [
            ("fs", "fs", Arc::new(fs_to_fs_copy)),
            ("fs", "s3", Arc::new(remote_stream_copy)),
            ("s3", "fs", Arc::new(remote_stream_copy)),
            ("s3", "s3", Arc::new(s3_server_copy)),
        ];
        for (src, dst, func) in defaults {
            let _ = table.insert((src.to_string(), dst.to_string()), func);
        }
        table
    })
}

/// Register a copy function for a protocol pair. Duplicate registration is
/// refused.
pub fn register_copy_func(
    src_protocol: &str,
    dst_protocol: &str,
    func: impl Fn(&AnyPath, &AnyPath, &CopyOptions) -> Result<()> + Send + Sync + 'static,
) -> Result<()> {
    let key = (src_protocol.to_string(), dst_protocol.to_string());
    if copy_table().insert(key, Arc::new(func)).is_err() {
        return Err(Error::already_exists(format!(
            "copy function: {src_protocol}->{dst_protocol}"
        )));
    }
    Ok(())
}

fn mirror_times(src: &AnyPath, dst: &AnyPath) {
    if let Ok(stat) = src.stat(true) {
        // best effort; object stores reject custom modification times
        let _ = dst.set_times(stat.mtime, stat.mtime);
    }
}

fn stream_copy_with_chunk(
    src: &AnyPath,
    dst: &AnyPath,
    options: &CopyOptions,
    chunk_size: usize,
) -> Result<()> {
    if !options.overwrite && dst.exists(false)? {
        return Ok(());
    }

    let open_options = OpenOptions {
        followlinks: options.followlinks,
        ..OpenOptions::default()
    };
    let mut reader = src.open("rb", &open_options)?;
    let mut writer = dst.open("wb", &open_options)?;

    let mut buffer = vec![0u8; chunk_size];
    loop {
        let count = reader.readinto(&mut buffer)?;
        if count == 0 {
            break;
        }
        writer.write(&buffer[..count])?;
        if let Some(callback) = &options.callback {
            callback(count as u64);
        }
    }
    reader.close()?;
    writer.close()?;

    mirror_times(src, dst);
    Ok(())
}

fn default_copy(src: &AnyPath, dst: &AnyPath, options: &CopyOptions) -> Result<()> {
    stream_copy_with_chunk(src, dst, options, COPY_CHUNK_SIZE)
}

fn fs_to_fs_copy(src: &AnyPath, dst: &AnyPath, options: &CopyOptions) -> Result<()> {
    stream_copy_with_chunk(src, dst, options, 256 * 1024)
}

fn remote_stream_copy(src: &AnyPath, dst: &AnyPath, options: &CopyOptions) -> Result<()> {
    stream_copy_with_chunk(src, dst, options, REMOTE_CHUNK_SIZE)
}

fn s3_server_copy(src: &AnyPath, dst: &AnyPath, options: &CopyOptions) -> Result<()> {
    if !options.overwrite && dst.exists(false)? {
        return Ok(());
    }
    let size = src.stat(true)?.size;
    src.copy_native(dst)?;
    if let Some(callback) = &options.callback {
        callback(size);
    }
    Ok(())
}

/// Copy one file between any two backends.
pub fn copy(src: &AnyPath, dst: &AnyPath, options: &CopyOptions) -> Result<()> {
    // a dangling symlink cannot be represented on object storage
    if src.is_symlink()? && !options.followlinks && dst.protocol() != "fs" {
        return Ok(());
    }

    let key = (src.protocol().to_string(), dst.protocol().to_string());
    let func = copy_table().read(&key, |_, func| func.clone());
    match func {
        Some(func) => func(src, dst, options),
        None => default_copy(src, dst, options),
    }
}

#[derive(Clone)]
pub struct SyncOptions {
    pub force: bool,
    pub overwrite: bool,
    pub followlinks: bool,
    /// `(src_path, bytes_copied)` per chunk.
    pub callback: Option<Arc<dyn Fn(&str, u64) + Send + Sync>>,
    /// `(src_path, dst_path)` after each finished file.
    pub on_file_done: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            force: false,
            overwrite: true,
            followlinks: false,
            callback: None,
            on_file_done: None,
        }
    }
}

impl SyncOptions {
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Stat-based equality rule for skipping unchanged files. Content hashes
/// win when both sides expose one; otherwise size plus a
/// not-older-destination mtime check.
fn is_same_file(src: &StatResult, dst: &StatResult) -> bool {
    if let (Some(src_etag), Some(dst_etag)) =
        (src.extra.get("etag"), dst.extra.get("etag"))
    {
        return src_etag == dst_etag;
    }
    src.size == dst.size && dst.mtime >= src.mtime
}

/// The `(src, dst)` file pairs a sync of `src` onto `dst` would consider.
/// Exposed so callers can drive the copies through a map function of their
/// choosing.
pub fn sync_pairs(src: &AnyPath, dst: &AnyPath, followlinks: bool) -> Result<Vec<(AnyPath, AnyPath)>> {
    if !src.is_dir()? {
        return Ok(vec![(src.clone(), dst.clone())]);
    }
    let root = src.as_str().trim_end_matches('/').to_string();
    let mut pairs = Vec::new();
    for entry in src.scan(false, followlinks)? {
        let entry = entry?;
        let relative = entry
            .path
            .strip_prefix(&root)
            .unwrap_or(&entry.path)
            .trim_start_matches('/');
        let target = if relative.is_empty() {
            dst.clone()
        } else {
            dst.join(&[relative])?
        };
        pairs.push((AnyPath::new(&entry.path)?, target));
    }
    Ok(pairs)
}

/// Mirror `src` onto `dst`, skipping files the equality rule reports
/// unchanged. Returns the number of files copied. Never removes or mutates
/// destination entries that have no source counterpart.
pub fn sync(src: &AnyPath, dst: &AnyPath, options: &SyncOptions) -> Result<usize> {
    let mut copied = 0usize;
    for (source, target) in sync_pairs(src, dst, options.followlinks)? {
        let mut should_sync = true;
        if !options.force {
            if !options.overwrite && target.exists(options.followlinks)? {
                should_sync = false;
            } else if target.exists(options.followlinks)?
                && is_same_file(
                    &source.stat(options.followlinks)?,
                    &target.stat(options.followlinks)?,
                )
            {
                should_sync = false;
            }
        }
        if !should_sync {
            tracing::debug!("skip unchanged file: {source}");
            continue;
        }

        let callback = options.callback.clone().map(|callback| {
            let path = source.as_str().to_string();
            let callback: Arc<ProgressCallback> =
                Arc::new(move |bytes: u64| callback(&path, bytes));
            callback
        });
        copy(
            &source,
            &target,
            &CopyOptions {
                followlinks: options.followlinks,
                overwrite: true,
                callback,
            },
        )?;
        copied += 1;
        if let Some(on_file_done) = &options.on_file_done {
            on_file_done(source.as_str(), target.as_str());
        }
    }
    Ok(copied)
}

/// Rename when the backend can, otherwise sync and remove the source.
pub fn move_path(src: &AnyPath, dst: &AnyPath, overwrite: bool) -> Result<()> {
    if src == dst {
        return Err(Error::SameFile {
            src: src.as_str().to_string(),
            dst: dst.as_str().to_string(),
        });
    }
    if src.protocol() == dst.protocol() {
        match src.rename(dst) {
            Err(Error::Unsupported { .. }) => {}
            result => return result,
        }
    }
    sync(
        src,
        dst,
        &SyncOptions::default().overwrite(overwrite).force(false),
    )?;
    src.remove(true)
}

/// Concatenate sources into `dst`, using the object-store native part-copy
/// path when every path involved is on S3.
pub fn concat(sources: &[AnyPath], dst: &AnyPath) -> Result<()> {
    let all_s3 = dst.protocol() == "s3"
        && dst.profile().is_none()
        && sources
            .iter()
            .all(|source| source.protocol() == "s3" && source.profile().is_none());
    if all_s3 {
        let mut s3_sources = Vec::with_capacity(sources.len());
        for source in sources {
            s3_sources.push(crate::s3::S3Path::new(source.as_str(), None)?);
        }
        let s3_dst = crate::s3::S3Path::new(dst.as_str(), None)?;
        return crate::s3::concat(&s3_sources, &s3_dst, config().writer_block_size);
    }

    let mut writer = dst.open("wb", &OpenOptions::default())?;
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    for source in sources {
        let mut reader = source.open("rb", &OpenOptions::default())?;
        loop {
            let count = reader.readinto(&mut buffer)?;
            if count == 0 {
                break;
            }
            writer.write(&buffer[..count])?;
        }
        reader.close()?;
    }
    writer.close()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::s3::testing::global_mock;
    use std::{
        fs,
        sync::atomic::{AtomicU64, Ordering},
    };

    fn fs_path(path: &std::path::Path) -> AnyPath {
        AnyPath::new(path.to_string_lossy().as_ref()).unwrap()
    }

    #[test]
    fn fs_copy_reports_progress_and_mirrors_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, vec![9u8; 100_000]).unwrap();
        let dst = dir.path().join("dst.bin");

        let progressed = Arc::new(AtomicU64::new(0));
        let seen = progressed.clone();
        let options = CopyOptions {
            callback: Some(Arc::new(move |bytes| {
                seen.fetch_add(bytes, Ordering::SeqCst);
            })),
            ..CopyOptions::default()
        };
        copy(&fs_path(&src), &fs_path(&dst), &options).unwrap();

        assert_eq!(progressed.load(Ordering::SeqCst), 100_000);
        assert_eq!(fs::read(&dst).unwrap().len(), 100_000);

        let src_stat = fs_path(&src).stat(true).unwrap();
        let dst_stat = fs_path(&dst).stat(true).unwrap();
        assert!((src_stat.mtime - dst_stat.mtime).abs() < 2.0);
    }

    #[test]
    fn copy_is_idempotent_with_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        fs::write(&src, b"same").unwrap();
        let dst = dir.path().join("b");

        copy(&fs_path(&src), &fs_path(&dst), &CopyOptions::default()).unwrap();
        copy(&fs_path(&src), &fs_path(&dst), &CopyOptions::default()).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"same");
    }

    #[test]
    fn overwrite_false_preserves_the_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        fs::write(&src, b"new content").unwrap();
        let dst = dir.path().join("b");
        fs::write(&dst, b"old").unwrap();

        let options = CopyOptions {
            overwrite: false,
            ..CopyOptions::default()
        };
        copy(&fs_path(&src), &fs_path(&dst), &options).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"old");
    }

    #[test]
    fn fs_to_s3_and_back() {
        global_mock().create_bucket("transfer-rt");
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload");
        fs::write(&src, b"round trip payload").unwrap();

        let remote = AnyPath::new("s3://transfer-rt/payload").unwrap();
        copy(&fs_path(&src), &remote, &CopyOptions::default()).unwrap();
        assert_eq!(
            global_mock()
                .object_bytes("transfer-rt", "payload")
                .unwrap()
                .as_ref(),
            b"round trip payload"
        );

        let back = dir.path().join("back");
        copy(&remote, &fs_path(&back), &CopyOptions::default()).unwrap();
        assert_eq!(fs::read(&back).unwrap(), b"round trip payload");
    }

    #[test]
    fn s3_server_side_copy_uses_the_native_path() {
        global_mock().create_bucket("transfer-native");
        global_mock().insert_object("transfer-native", "src", &b"native"[..]);

        let src = AnyPath::new("s3://transfer-native/src").unwrap();
        let dst = AnyPath::new("s3://transfer-native/dst").unwrap();
        copy(&src, &dst, &CopyOptions::default()).unwrap();

        assert_eq!(
            global_mock()
                .object_bytes("transfer-native", "dst")
                .unwrap()
                .as_ref(),
            b"native"
        );
    }

    #[test]
    fn sync_mirrors_a_tree_and_skips_unchanged() {
        global_mock().create_bucket("transfer-sync");
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("tree/sub")).unwrap();
        fs::write(dir.path().join("tree/one.txt"), b"1").unwrap();
        fs::write(dir.path().join("tree/sub/two.txt"), b"22").unwrap();

        let src = fs_path(&dir.path().join("tree"));
        let dst = AnyPath::new("s3://transfer-sync/mirror").unwrap();

        let copied = sync(&src, &dst, &SyncOptions::default()).unwrap();
        assert_eq!(copied, 2);
        let mut keys = global_mock().object_keys("transfer-sync");
        keys.sort();
        assert_eq!(keys, vec!["mirror/one.txt", "mirror/sub/two.txt"]);

        // second run: sizes and hashes are unchanged, nothing copies
        let copied = sync(&src, &dst, &SyncOptions::default()).unwrap();
        assert_eq!(copied, 0);
    }

    #[test]
    fn sync_without_overwrite_is_monotone() {
        global_mock().create_bucket("transfer-mono");
        global_mock().insert_object("transfer-mono", "mirror/kept.txt", &b"existing"[..]);

        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("tree")).unwrap();
        fs::write(dir.path().join("tree/kept.txt"), b"replacement").unwrap();
        fs::write(dir.path().join("tree/fresh.txt"), b"fresh").unwrap();

        let src = fs_path(&dir.path().join("tree"));
        let dst = AnyPath::new("s3://transfer-mono/mirror").unwrap();
        sync(&src, &dst, &SyncOptions::default().overwrite(false)).unwrap();

        assert_eq!(
            global_mock()
                .object_bytes("transfer-mono", "mirror/kept.txt")
                .unwrap()
                .as_ref(),
            b"existing"
        );
        assert_eq!(
            global_mock()
                .object_bytes("transfer-mono", "mirror/fresh.txt")
                .unwrap()
                .as_ref(),
            b"fresh"
        );
    }

    #[test]
    fn move_renames_within_a_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("here");
        fs::write(&src, b"movable").unwrap();
        let dst = dir.path().join("there");

        move_path(&fs_path(&src), &fs_path(&dst), true).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"movable");
    }

    #[test]
    fn move_to_itself_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("self");
        fs::write(&src, b"x").unwrap();

        let result = move_path(&fs_path(&src), &fs_path(&src), true);
        assert!(matches!(result, Err(Error::SameFile { .. })));
    }

    #[test]
    fn stream_concat_joins_sources() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("p1"), b"one ").unwrap();
        fs::write(dir.path().join("p2"), b"two").unwrap();
        let dst = dir.path().join("joined");

        concat(
            &[
                fs_path(&dir.path().join("p1")),
                fs_path(&dir.path().join("p2")),
            ],
            &fs_path(&dst),
        )
        .unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"one two");
    }

    #[test]
    fn s3_concat_routes_to_the_native_path() {
        global_mock().create_bucket("transfer-concat");
        global_mock().insert_object("transfer-concat", "a", &b"alpha "[..]);
        global_mock().insert_object("transfer-concat", "b", &b"beta"[..]);

        concat(
            &[
                AnyPath::new("s3://transfer-concat/a").unwrap(),
                AnyPath::new("s3://transfer-concat/b").unwrap(),
            ],
            &AnyPath::new("s3://transfer-concat/out").unwrap(),
        )
        .unwrap();
        assert_eq!(
            global_mock()
                .object_bytes("transfer-concat", "out")
                .unwrap()
                .as_ref(),
            b"alpha beta"
        );
    }

    #[test]
    fn duplicate_copy_registration_is_refused() {
        let result = register_copy_func("fs", "s3", |src, dst, options| {
            default_copy(src, dst, options)
        });
        assert!(matches!(result, Err(Error::AlreadyExists { .. })));
    }
}
