//! One path-like API over heterogeneous storage backends, with streaming
//! readers and multipart writers tuned for object storage.
//!
//! Paths select their backend by scheme: `fs://` (or a plain OS path),
//! `s3://` / `s3+profile://`, `http(s)://` and `stdio://-`. Opening a path
//! returns a streaming handle; the copy/sync engine composes handles or
//! routes to backend-native fast paths.
#![forbid(unsafe_code)]
#![deny(
    arithmetic_overflow,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications,
    rustdoc::bare_urls,
    rustdoc::broken_intra_doc_links
)]
#![deny(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod fs;
pub mod glob;
pub mod http;
pub mod path;
pub mod retry;
pub mod s3;
pub mod stdio;
pub mod stream;
pub mod transfer;

pub use client::ObjectClient;
pub use error::{Error, Result};
pub use path::{
    glob, register_protocol, AnyPath, EntryIter, FileEntry, OpenMode, OpenOptions, PathOps,
    ReaderStyle, StatResult, WriterStyle,
};
pub use stream::{
    BufferedWriter, CachedHandler, CombineReader, FileLike, LimitedSeekableWriter, MemoryHandler,
    PipeReader, PipeWriter, PrefetchReader, RangeSource, ReaderOptions, SeekableWriterOptions,
    ShareCacheReader, WriterOptions,
};
pub use transfer::{
    concat, copy, move_path, register_copy_func, sync, sync_pairs, CopyOptions, SyncOptions,
};

/// Wrap an entry iterator so that an empty iteration surfaces `error` at
/// consumption time unless `missing_ok` is set. Callers that merely check
/// emptiness therefore see an empty sequence, not an error.
pub(crate) fn missing_ok_iter(
    inner: EntryIter,
    missing_ok: bool,
    error: Error,
) -> EntryIter {
    struct MissingOk {
        inner: EntryIter,
        error: Option<Error>,
        yielded: bool,
    }

    impl Iterator for MissingOk {
        type Item = Result<FileEntry>;

        fn next(&mut self) -> Option<Self::Item> {
            match self.inner.next() {
                Some(item) => {
                    self.yielded = true;
                    Some(item)
                }
                None if !self.yielded => self.error.take().map(Err),
                None => None,
            }
        }
    }

    Box::new(MissingOk {
        inner,
        error: if missing_ok { None } else { Some(error) },
        yielded: false,
    })
}
