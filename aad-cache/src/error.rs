//! Error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested entry does not exist.
    #[error("no such entry")]
    NotFound,

    /// An existing cache file does not match the expected owner, group or mode.
    #[error("unexpected permissions on {path:?}: {reason}")]
    Tampering { path: PathBuf, reason: String },

    /// The cache needs to be created but the caller is not privileged.
    #[error("insufficient permissions to create the cache in {0:?}")]
    NotPrivileged(PathBuf),

    /// The operation needs at least read access to the shadow database.
    #[error("shadow database is not available for reading")]
    ShadowNotReadable,

    /// The operation needs write access to the shadow database.
    #[error("shadow database is not available for writing")]
    ShadowNotWritable,

    /// The cache was opened without write access.
    #[error("cache is opened read-only")]
    ReadOnly,

    /// The user did not authenticate online within the revalidation period.
    #[error("cached credentials for {0:?} have expired")]
    CredentialsExpired(String),

    /// Offline authentication was disabled by the configuration.
    #[error("offline authentication is disabled")]
    OfflineAuthDisabled,

    /// The supplied password does not match the cached hash.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Unknown attribute name.
    #[error("invalid attribute {0:?}")]
    InvalidAttribute(String),

    /// The attribute exists but may not be modified.
    #[error("attribute {0:?} cannot be modified")]
    ReadOnlyAttribute(String),

    /// The home directory pattern contains an unknown token.
    #[error("invalid home directory pattern {pattern:?}: {reason}")]
    HomePattern { pattern: String, reason: String },

    /// The database is inconsistent (e.g. a login without its private group).
    #[error("inconsistent cache: {0}")]
    Inconsistent(String),

    /// Error from libcrypt.
    #[error("password hashing failed: {0}")]
    Crypt(String),

    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Sys {
        context: String,
        #[source]
        source: nix::Error,
    },
}

impl CacheError {
    /// Whether the entry simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }

    /// Whether the error is caused by temporary resource exhaustion or locking and the caller
    /// may retry later.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Database {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::OutOfMemory
            ),
            CacheError::Io { source, .. } => matches!(
                source.raw_os_error(),
                Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE)
            ),
            CacheError::Sys { source, .. } => matches!(
                source,
                nix::errno::Errno::EAGAIN
                    | nix::errno::Errno::ENOMEM
                    | nix::errno::Errno::EMFILE
                    | nix::errno::Errno::ENFILE
            ),
            _ => false,
        }
    }

    /// Whether the error means the cache could not be opened at all (permissions, tampering,
    /// I/O).
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CacheError::Tampering { .. }
                | CacheError::NotPrivileged(_)
                | CacheError::Io { .. }
                | CacheError::Sys { .. }
                | CacheError::Database { .. }
        ) && !self.is_transient()
    }
}

/// Attach a context message to lower level errors.
pub(crate) trait Context<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, CacheError>;
}

impl<T> Context<T> for Result<T, rusqlite::Error> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, CacheError> {
        self.map_err(|source| match source {
            rusqlite::Error::QueryReturnedNoRows => CacheError::NotFound,
            source => CacheError::Database {
                context: context.into(),
                source,
            },
        })
    }
}

impl<T> Context<T> for Result<T, std::io::Error> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, CacheError> {
        self.map_err(|source| CacheError::Io {
            context: context.into(),
            source,
        })
    }
}

impl<T> Context<T> for Result<T, nix::Error> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, CacheError> {
        self.map_err(|source| CacheError::Sys {
            context: context.into(),
            source,
        })
    }
}
