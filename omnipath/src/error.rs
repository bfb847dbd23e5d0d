//! Backend-neutral error kinds. Backends translate their native failures at
//! the boundary; nothing above the boundary inspects native error types.
use std::{io, sync::Arc};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such file: {path}")]
    NotFound { path: String },
    #[error("no such bucket: {path}")]
    BucketNotFound { path: String },
    #[error("file exists: {path}")]
    AlreadyExists { path: String },
    #[error("not a directory: {path}")]
    NotADirectory { path: String },
    #[error("is a directory: {path}")]
    IsADirectory { path: String },
    #[error("permission denied: {path}, {detail}")]
    PermissionDenied { path: String, detail: String },
    #[error("invalid configuration: {detail}")]
    Misconfigured { detail: String },
    #[error("name too long: {path}")]
    NameTooLong { path: String },
    #[error("file changed while reading: {path}, etag before: {before}, after: {after}")]
    ObjectChanged {
        path: String,
        before: String,
        after: String,
    },
    #[error("invalid seek: {path}, target offset: {offset}")]
    InvalidSeek { path: String, offset: i64 },
    #[error("file already closed: {path}")]
    InvalidState { path: String },
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },
    #[error("unsupported operation: {path}, operation: {operation}")]
    Unsupported { path: String, operation: String },
    #[error("same file: {src} and {dst}")]
    SameFile { src: String, dst: String },
    #[error("IO error: {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("unknown error: {path}: {source}")]
    Unknown {
        path: String,
        #[source]
        source: Arc<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Error::AlreadyExists { path: path.into() }
    }

    pub fn invalid_state(path: impl Into<String>) -> Self {
        Error::InvalidState { path: path.into() }
    }

    pub fn unsupported(path: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::Unsupported {
            path: path.into(),
            operation: operation.into(),
        }
    }

    pub fn unknown(path: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Unknown {
            path: path.into(),
            source: Arc::new(source.into()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::BucketNotFound { .. }
        )
    }
}

// Block fetch results are shared between readers through the block cache, so
// the error itself has to be cloneable. All variants carry owned strings
// except `Io`, which is rebuilt from its kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        use Error::*;

        match self {
            NotFound { path } => NotFound { path: path.clone() },
            BucketNotFound { path } => BucketNotFound { path: path.clone() },
            AlreadyExists { path } => AlreadyExists { path: path.clone() },
            NotADirectory { path } => NotADirectory { path: path.clone() },
            IsADirectory { path } => IsADirectory { path: path.clone() },
            PermissionDenied { path, detail } => PermissionDenied {
                path: path.clone(),
                detail: detail.clone(),
            },
            Misconfigured { detail } => Misconfigured {
                detail: detail.clone(),
            },
            NameTooLong { path } => NameTooLong { path: path.clone() },
            ObjectChanged {
                path,
                before,
                after,
            } => ObjectChanged {
                path: path.clone(),
                before: before.clone(),
                after: after.clone(),
            },
            InvalidSeek { path, offset } => InvalidSeek {
                path: path.clone(),
                offset: *offset,
            },
            InvalidState { path } => InvalidState { path: path.clone() },
            InvalidArgument { detail } => InvalidArgument {
                detail: detail.clone(),
            },
            Unsupported { path, operation } => Unsupported {
                path: path.clone(),
                operation: operation.clone(),
            },
            SameFile { src, dst } => SameFile {
                src: src.clone(),
                dst: dst.clone(),
            },
            Io { path, source } => Io {
                path: path.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
            Unknown { path, source } => Unknown {
                path: path.clone(),
                source: source.clone(),
            },
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match &err {
            Error::NotFound { .. } | Error::BucketNotFound { .. } => io::ErrorKind::NotFound,
            Error::AlreadyExists { .. } => io::ErrorKind::AlreadyExists,
            Error::PermissionDenied { .. } => io::ErrorKind::PermissionDenied,
            Error::InvalidSeek { .. } | Error::InvalidArgument { .. } => {
                io::ErrorKind::InvalidInput
            }
            Error::Unsupported { .. } => io::ErrorKind::Unsupported,
            Error::Io { source, .. } => source.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Attach a path to a raw filesystem error, mapping the well-known kinds onto
/// the neutral taxonomy.
pub fn translate_fs_error(source: io::Error, path: impl Into<String>) -> Error {
    let path = path.into();
    match source.kind() {
        io::ErrorKind::NotFound => Error::NotFound { path },
        io::ErrorKind::PermissionDenied => Error::PermissionDenied {
            path,
            detail: source.to_string(),
        },
        io::ErrorKind::AlreadyExists => Error::AlreadyExists { path },
        io::ErrorKind::NotADirectory => Error::NotADirectory { path },
        io::ErrorKind::IsADirectory => Error::IsADirectory { path },
        _ => Error::Io { path, source },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fs_translation_keeps_the_path() {
        let err = translate_fs_error(
            io::Error::new(io::ErrorKind::NotFound, "gone"),
            "/tmp/missing",
        );
        assert!(matches!(err, Error::NotFound { ref path } if path == "/tmp/missing"));
    }

    #[test]
    fn unknown_errors_clone_with_their_cause() {
        let err = Error::unknown("s3://bucket/key", anyhow::anyhow!("boom"));
        let clone = err.clone();
        assert!(clone.to_string().contains("boom"));
        assert!(clone.to_string().contains("s3://bucket/key"));
    }

    #[test]
    fn io_error_kind_mapping() {
        let err: io::Error = Error::not_found("x").into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let err: io::Error = Error::already_exists("x").into();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
