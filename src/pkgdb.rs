use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use nix::fcntl::{flock, FlockArg};
use rayon::prelude::*;
use thiserror::Error;

use crate::pkg::{Files, Pkg, PkgError, PkgState};
use crate::value::{Value, ValueError};

#[derive(Debug, Error)]
pub enum PkgdbError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Pkg(#[from] PkgError),

    #[error("the package database lock is held by another process")]
    Busy,

    #[error("illegal state transition for '{pkgname}': {from:?} -> {to:?}")]
    IllegalTransition {
        pkgname: String,
        from: PkgState,
        to: PkgState,
    },

    #[error("no such installed package '{0}'")]
    NotFound(String),

    #[error("callback reported an error for '{pkgname}'")]
    CallbackFailed { pkgname: String },
}

const FORMAT: &str = "0.38";

/// A held advisory lock on `<metadir>/.pkgdb.lock`, released on drop.
pub struct PkgdbLock {
    _file: File,
}

fn lock_path(metadir: &Path) -> PathBuf {
    metadir.join(".pkgdb.lock")
}

fn acquire_lock(metadir: &Path) -> Result<PkgdbLock, PkgdbError> {
    std::fs::create_dir_all(metadir)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path(metadir))?;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => {
            log::debug!("acquired pkgdb lock at {}", lock_path(metadir).display());
            Ok(PkgdbLock { _file: file })
        }
        Err(nix::errno::Errno::EWOULDBLOCK) => {
            log::warn!("pkgdb lock at {} is held by another process", lock_path(metadir).display());
            Err(PkgdbError::Busy)
        }
        Err(e) => Err(PkgdbError::Io(e.into())),
    }
}

/// The installed-package dict, per-arch file lock, state machine
/// transitions, and file-manifest lookup.
pub struct Pkgdb {
    metadir: PathBuf,
    _lock: PkgdbLock,
    installed: BTreeMap<String, Pkg>,
    snapshot: Value,
    files_cache: Mutex<BTreeMap<String, Files>>,
}

impl Pkgdb {
    fn backing_path(metadir: &Path) -> PathBuf {
        metadir.join(format!("pkgdb-{FORMAT}.plist"))
    }

    fn files_path(metadir: &Path, pkgname: &str) -> PathBuf {
        metadir.join(format!("{pkgname}-files.plist"))
    }

    /// Opens the pkgdb under `metadir`, acquiring its non-blocking advisory
    /// lock. Returns [`PkgdbError::Busy`] if another process holds it.
    pub fn open(metadir: &Path) -> Result<Self, PkgdbError> {
        let lock = acquire_lock(metadir)?;
        let path = Self::backing_path(metadir);
        let doc = Value::internalize_from_file(&path)?.unwrap_or_else(Value::dict);

        let installed = doc
            .as_dict()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|(k, _)| k != "_XBPS_ALTERNATIVES_")
            .map(|(k, v)| Ok((k, Pkg::from_value(v)?)))
            .collect::<Result<BTreeMap<_, _>, PkgdbError>>()?;

        Ok(Pkgdb {
            metadir: metadir.to_path_buf(),
            _lock: lock,
            installed,
            snapshot: doc,
            files_cache: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn get_pkg(&self, name: &str) -> Option<&Pkg> {
        self.installed.get(name)
    }

    pub fn get_pkg_mut(&mut self, name: &str) -> Option<&mut Pkg> {
        self.installed.get_mut(name)
    }

    /// Scans for a pkg whose `provides` list satisfies `name`.
    pub fn get_virtualpkg(&self, name: &str) -> Option<&Pkg> {
        self.installed.values().find(|pkg| {
            pkg.provides()
                .map(|deps| deps.iter().any(|d| d.name() == name))
                .unwrap_or(false)
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.installed.contains_key(name)
    }

    pub fn insert(&mut self, pkg: Pkg) -> Result<(), PkgdbError> {
        let name = pkg.pkgname()?.to_string();
        self.installed.insert(name, pkg);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Pkg> {
        self.installed.remove(name)
    }

    /// Pkgs in pkgdb left in `HALF_UNPACKED`/`HALF_REMOVED`, as `init` must
    /// scan for on open per the half-state recovery rule.
    pub fn half_state_pkgs(&self) -> Vec<&Pkg> {
        self.installed
            .values()
            .filter(|p| matches!(p.state(), PkgState::HalfUnpacked | PkgState::HalfRemoved))
            .collect()
    }

    /// Transitions `name`'s state per the diagram in §3. Illegal transitions
    /// return an error without modifying the dict. The write is deferred
    /// until [`Pkgdb::flush`].
    pub fn set_pkg_state(&mut self, name: &str, to: PkgState) -> Result<(), PkgdbError> {
        let pkg = self
            .installed
            .get_mut(name)
            .ok_or_else(|| PkgdbError::NotFound(name.to_string()))?;
        let from = pkg.state();
        if !from.can_transition_to(to) {
            return Err(PkgdbError::IllegalTransition {
                pkgname: name.to_string(),
                from,
                to,
            });
        }
        pkg.set_state(to);
        Ok(())
    }

    /// Lazy-loads and caches the file manifest for `name`.
    pub fn get_pkg_files(&self, name: &str) -> Result<Files, PkgdbError> {
        if let Some(cached) = self.files_cache.lock().unwrap().get(name) {
            return Ok(cached.clone());
        }
        let path = Self::files_path(&self.metadir, name);
        let value = Value::internalize_from_file(&path)?.unwrap_or_else(Value::dict);
        let files = Files::from_value(&value)?;
        self.files_cache
            .lock()
            .unwrap()
            .insert(name.to_string(), files.clone());
        Ok(files)
    }

    pub fn set_pkg_files(&self, name: &str, files: &Files) -> Result<(), PkgdbError> {
        let path = Self::files_path(&self.metadir, name);
        files.to_value().externalize_to_file(&path)?;
        self.files_cache
            .lock()
            .unwrap()
            .insert(name.to_string(), files.clone());
        Ok(())
    }

    /// Iterates in sorted pkgname order, sequentially, stopping at the first
    /// error the callback returns.
    pub fn foreach<E>(&self, mut cb: impl FnMut(&Pkg) -> Result<(), E>) -> Result<(), E> {
        for pkg in self.installed.values() {
            cb(pkg)?;
        }
        Ok(())
    }

    /// Same iteration, fanned out over a worker pool for CPU-bound
    /// callbacks. Ordering of invocation is unspecified; the first error
    /// observed cancels the rest and is returned.
    pub fn foreach_multi<E: Send>(
        &self,
        cb: impl Fn(&Pkg) -> Result<(), E> + Sync,
    ) -> Result<(), E> {
        let cancelled = AtomicBool::new(false);
        let first_error: Mutex<Option<E>> = Mutex::new(None);

        self.installed.values().collect::<Vec<_>>().par_iter().for_each(|pkg| {
            if cancelled.load(Ordering::Relaxed) {
                return;
            }
            if let Err(e) = cb(pkg) {
                if !cancelled.swap(true, Ordering::Relaxed) {
                    *first_error.lock().unwrap() = Some(e);
                }
            }
        });

        match first_error.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Externalizes atomically; a no-op if nothing changed since the last
    /// load, and must be called before the lock is released (it is, via
    /// `Drop` order: callers hold `Pkgdb` for the transaction's duration and
    /// call `flush` explicitly at the phase boundaries the design names).
    pub fn flush(&mut self) -> Result<(), PkgdbError> {
        let mut dict = BTreeMap::new();
        for (name, pkg) in &self.installed {
            dict.insert(name.clone(), pkg.to_value());
        }
        let doc = Value::Dict(dict);

        if doc == self.snapshot {
            return Ok(());
        }

        let path = Self::backing_path(&self.metadir);
        doc.externalize_to_file(&path)?;
        self.snapshot = doc;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pkg> {
        self.installed.values()
    }

    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

#[cfg(test)]
#[path = "pkgdb.test.rs"]
mod test;
