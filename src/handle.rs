use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitmask_enum::bitmask;
use thiserror::Error;

use crate::callback::{NoopCallback, StateCallback};
use crate::config::{Config, ConfigError, VirtualPkgOverride};
use crate::pkgdb::{Pkgdb, PkgdbError};
use crate::repo::{Repo, RepoError};
use crate::repopool::{PoolFlags, RepoPool};
use crate::version::Pattern;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Pkgdb(#[from] PkgdbError),
}

/// Process-wide behavior switches, carried on [`Handle`] and consulted by
/// `TransactionBuilder`/`Executor`/`RepoPool`/`Fetcher`.
#[bitmask(u32)]
pub enum HandleFlags {
    InstallAuto,
    InstallManual,
    ForceConfigure,
    ForceRemoveFiles,
    ForceUnpack,
    DownloadOnly,
    UnpackOnly,
    IgnoreConfRepos,
    IgnoreFileConflicts,
    ReposMemsync,
    Bestmatch,
    Verbose,
    Debug,
}

impl HandleFlags {
    pub fn pool_flags(self) -> PoolFlags {
        if self.contains(HandleFlags::Bestmatch) {
            PoolFlags::Bestmatch
        } else {
            PoolFlags::none()
        }
    }
}

/// A cooperative cancel flag. The core never installs a signal handler
/// itself; an embedding CLI flips this (typically from a `signal-hook`
/// handler) and `Executor`/`TransactionBuilder` poll it between packages.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Process-wide configuration and live state, per the design's Handle
/// section: `rootdir`/`metadir`/`cachedir`/`confdir` paths, resolved arch,
/// the flag bitset, repo/virtualpkg/ignore lists, the lazily opened pkgdb,
/// and the callback set.
pub struct Handle {
    pub rootdir: PathBuf,
    pub metadir: PathBuf,
    pub cachedir: PathBuf,
    pub confdir: PathBuf,
    pub native_arch: String,
    pub target_arch: Option<String>,
    pub flags: HandleFlags,
    pub repositories: Vec<String>,
    pub virtualpkgs: Vec<VirtualPkgOverride>,
    pub ignored_pkgs: Vec<String>,
    pub noextract: Vec<String>,
    pub preserved_files: Vec<String>,
    pub cancel: CancellationToken,

    pkgdb: Option<Pkgdb>,
    repopool: RepoPool,
    state_cb: Arc<dyn StateCallback>,
}

impl Handle {
    /// Builds a Handle rooted at `rootdir`, deriving `metadir`/`cachedir`
    /// from it unless a fragment under `confdir` overrides them, and merging
    /// every `*.conf` fragment found there.
    pub fn init(rootdir: PathBuf, confdir: PathBuf, native_arch: String) -> Result<Self, HandleError> {
        let metadir_default = rootdir.join("var/db/xbps");
        let cachedir_default = rootdir.join("var/cache/xbps");

        let cfg = if confdir.is_dir() {
            Config::load_dir(&confdir)?
        } else {
            Config::default()
        };

        let metadir = metadir_default;
        let cachedir = cfg
            .cachedir
            .map(PathBuf::from)
            .unwrap_or(cachedir_default);
        let native_arch = cfg.architecture.unwrap_or(native_arch);
        let virtualpkgs = cfg.virtualpkgs;

        Ok(Handle {
            rootdir,
            metadir,
            cachedir,
            confdir,
            native_arch,
            target_arch: None,
            flags: HandleFlags::none(),
            repositories: cfg.repositories,
            virtualpkgs,
            ignored_pkgs: cfg.ignored_pkgs,
            noextract: cfg.noextract,
            preserved_files: cfg.preserved_files,
            cancel: CancellationToken::new(),
            pkgdb: None,
            repopool: RepoPool::new(),
            state_cb: Arc::new(NoopCallback),
        })
    }

    pub fn set_state_callback(&mut self, cb: Arc<dyn StateCallback>) {
        self.state_cb = cb;
    }

    pub fn state_callback(&self) -> &Arc<dyn StateCallback> {
        &self.state_cb
    }

    /// Lazily opens and caches the pkgdb, acquiring its advisory lock on
    /// first call.
    pub fn pkgdb(&mut self) -> Result<&mut Pkgdb, HandleError> {
        if self.pkgdb.is_none() {
            self.pkgdb = Some(Pkgdb::open(&self.metadir)?);
        }
        Ok(self.pkgdb.as_mut().unwrap())
    }

    pub fn pkgdb_opened(&self) -> bool {
        self.pkgdb.is_some()
    }

    pub fn repopool(&self) -> &RepoPool {
        &self.repopool
    }

    /// Adds an already-loaded repo to the pool, in `repositories` precedence
    /// order (callers push in the same order `repositories` lists them).
    pub fn push_repo(&mut self, repo: Repo) {
        self.repopool.push(repo);
    }

    /// Syncs every configured repo URI (`<arch>-repodata`, verified against
    /// its pinned public key) and loads the results into the pool, in
    /// `repositories` order. Collects every per-repo failure instead of
    /// stopping at the first one, so one unreachable mirror doesn't block
    /// the rest of the pool from syncing.
    pub fn sync_repos(&mut self) -> Result<(), Vec<(String, RepoError)>> {
        let arch = self.target_arch.clone().unwrap_or_else(|| self.native_arch.clone());
        let mut errors = Vec::new();

        for uri in self.repositories.clone() {
            let notice = |msg: String| log::debug!("{msg}");
            match Repo::sync(&uri, &arch, &self.metadir, &notice) {
                Ok(repo) => {
                    log::debug!("repo sync of '{uri}' succeeded with {} packages", repo.len());
                    self.repopool.push(repo);
                }
                Err(e) => {
                    log::warn!("repo sync of '{uri}' failed: {e}");
                    errors.push((uri, e));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Resolves a virtualpkg pattern to a concrete `pkgver`, consulting the
    /// configured override list before falling back to the repo pool, per
    /// "preferring a configured mapping over any provider".
    pub fn resolve_virtualpkg(&self, pattern: &Pattern) -> Option<String> {
        if let Some(over) = self.virtualpkgs.iter().find(|v| v.name == pattern.name()) {
            return Some(over.realpkgver.clone());
        }
        self.repopool
            .get_virtualpkg(pattern)
            .ok()
            .and_then(|pkg| pkg.pkgver().ok())
    }

    /// Flushes and releases the pkgdb lock (if opened) and drops the repo
    /// pool, per the design's `end` lifecycle step.
    pub fn end(&mut self) -> Result<(), HandleError> {
        if let Some(pkgdb) = self.pkgdb.as_mut() {
            pkgdb.flush()?;
        }
        self.pkgdb = None;
        self.repopool = RepoPool::new();
        Ok(())
    }
}

#[cfg(test)]
#[path = "handle.test.rs"]
mod test;
