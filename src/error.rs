use thiserror::Error;

use crate::archive;
use crate::fetch;
use crate::pkg;
use crate::pkgdb;
use crate::plugin;
use crate::repopool;
use crate::transaction;
use crate::verify;

/// The crate's public error surface. Every variant mirrors one of the POSIX
/// error kinds in the design (`INVAL`, `NOT_FOUND`, ...) so a CLI embedder can
/// translate a failed operation into the historical exit code.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: a bad version string, cyclic deps in repo data.
    #[error("invalid input: {0}")]
    Inval(String),

    /// The requested package is missing from the repo pool or pkgdb.
    #[error("package not found: {0}")]
    NotFound(String),

    /// The requested operation is redundant (already installed / up to date).
    #[error("already satisfied: {0}")]
    Exists(String),

    /// At least one required dependency has no candidate in the repo pool.
    #[error("missing dependencies: {missing_deps:?}")]
    NoDev { missing_deps: Vec<String> },

    /// An unresolved shared-library requirement.
    #[error("missing shared libraries: {missing_shlibs:?}")]
    NoExec { missing_shlibs: Vec<String> },

    /// A file or package-name conflict was detected.
    #[error("conflicts detected: {conflicts:?}")]
    Again { conflicts: Vec<String> },

    /// Insufficient free space under `rootdir`.
    #[error("not enough disk space: need {total_installed_size}, have {disk_free_size}")]
    NoSpc {
        total_installed_size: u64,
        disk_free_size: u64,
    },

    /// The package manager itself must be updated before anything else.
    #[error("self-update required before this transaction can proceed")]
    Busy,

    /// The cooperative-cancel flag was observed; the current op finished but
    /// no further ops were started.
    #[error("transaction interrupted")]
    Interrupted,

    /// Transport failure while fetching an artifact or repodata.
    #[error(transparent)]
    Fetch(#[from] fetch::FetchError),

    /// SHA-256 or RSA signature verification failure.
    #[error(transparent)]
    Verify(#[from] verify::VerifyError),

    /// Archive reading failure (tar/codec framing, missing member).
    #[error(transparent)]
    Archive(#[from] archive::ArchiveError),

    /// Pkgdb-level failure (lock contention, corrupt state transition).
    #[error(transparent)]
    Pkgdb(#[from] pkgdb::PkgdbError),

    /// RepoPool-level failure.
    #[error(transparent)]
    RepoPool(#[from] repopool::RepoPoolError),

    /// TransactionBuilder-level failure not covered by a more specific kind.
    #[error(transparent)]
    Transaction(#[from] transaction::TransactionError),

    /// A `Pkg` field was missing or had the wrong type.
    #[error(transparent)]
    Pkg(#[from] pkg::PkgError),

    /// An `INSTALL`/`REMOVE` script exited unsuccessfully.
    #[error(transparent)]
    Plugin(#[from] plugin::PluginError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps this error to the historical POSIX-ish exit code the CLI exposes
    /// for test determinism (see the external-interfaces exit code table).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Exists(_) => libc_like::EEXIST,
            Error::NotFound(_) => libc_like::ENOENT,
            Error::NoDev { .. } | Error::NoExec { .. } => libc_like::ENXIO,
            Error::Busy => libc_like::EBUSY,
            Error::NoSpc { .. } => libc_like::ENOSPC,
            Error::RepoPool(repopool::RepoPoolError::NotSupported) => libc_like::ENOTSUP,
            Error::Inval(_) | Error::Transaction(transaction::TransactionError::Cycle(_)) => {
                libc_like::EINVAL
            }
            _ => 1,
        }
    }
}

/// Small stand-in for the handful of POSIX error numbers the design names.
/// Kept local rather than depending on `libc` since no pack example links it
/// and only the numeric values (not syscalls) are needed here.
mod libc_like {
    pub const EEXIST: i32 = 17;
    pub const ENOENT: i32 = 2;
    pub const ENXIO: i32 = 6;
    pub const EBUSY: i32 = 16;
    pub const ENOSPC: i32 = 28;
    pub const ENOTSUP: i32 = 95;
    pub const EINVAL: i32 = 22;
}
