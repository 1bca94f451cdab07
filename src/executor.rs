use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use url::Url;

use crate::archive::Archive;
use crate::callback::{NoopCallback, StateCallback, StateDetail, TransState, UnpackProgress};
use crate::error::Error;
use crate::fetch::{fetcher_for, FetchFlags, FetchProgress};
use crate::handle::CancellationToken;
use crate::pkg::{DirEntry, FileEntry, Files, LinkEntry, Pkg, PkgState};
use crate::pkgdb::Pkgdb;
use crate::plugin::{PluginRunner, ScriptAction};
use crate::repopool::RepoPool;
use crate::transaction::{TransKind, TransactionOp, TransactionPlan};
use crate::verify::{verify_sha256, PublicKey, StreamingSha256};

/// Drains a [`TransactionPlan`] through the four on-disk phases the design
/// names (Download, Verify, Files, Run+Configure), writing pkgdb state
/// eagerly between steps so a crash leaves a well-defined intermediate
/// state the next `Executor::commit` recognizes and finishes.
pub struct Executor<'a> {
    pkgdb: &'a mut Pkgdb,
    repopool: &'a RepoPool,
    rootdir: PathBuf,
    cachedir: PathBuf,
    metadir: PathBuf,
    state_cb: Arc<dyn StateCallback>,
    cancel: CancellationToken,
    ignore_file_conflicts: bool,
    preserved_files: Vec<String>,
    noextract: Vec<String>,
    download_only: bool,
    unpack_only: bool,
    force_remove_files: bool,
    plugin: PluginRunner,
}

impl<'a> Executor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pkgdb: &'a mut Pkgdb,
        repopool: &'a RepoPool,
        rootdir: &Path,
        cachedir: &Path,
        metadir: &Path,
        native_arch: String,
        target_arch: Option<String>,
        force_configure: bool,
        ignore_file_conflicts: bool,
        preserved_files: Vec<String>,
        noextract: Vec<String>,
        download_only: bool,
        unpack_only: bool,
        force_remove_files: bool,
        cancel: CancellationToken,
    ) -> Self {
        Executor {
            pkgdb,
            repopool,
            rootdir: rootdir.to_path_buf(),
            cachedir: cachedir.to_path_buf(),
            metadir: metadir.to_path_buf(),
            state_cb: Arc::new(NoopCallback),
            cancel,
            ignore_file_conflicts,
            preserved_files,
            noextract,
            download_only,
            unpack_only,
            force_remove_files,
            plugin: PluginRunner {
                rootdir: rootdir.to_path_buf(),
                native_arch,
                target_arch,
                force_configure,
            },
        }
    }

    pub fn set_state_callback(&mut self, cb: Arc<dyn StateCallback>) {
        self.state_cb = cb;
    }

    /// Runs every phase in order, stopping at the first error. Cancellation
    /// is only honored between phases and between packages within the Run
    /// phase, never mid-script or mid-extraction, so a crash or signal always
    /// lands on a state the pkgdb diagram in §3 recognizes.
    pub fn commit(&mut self, plan: TransactionPlan) -> Result<(), Error> {
        self.resume_half_unpacked()?;
        if plan.is_empty() {
            return Ok(());
        }

        self.download(&plan)?;
        self.check_cancel()?;
        self.verify(&plan)?;
        if self.download_only {
            log::debug!("download_only set, stopping after verify phase");
            return Ok(());
        }
        self.check_cancel()?;
        self.collect_files(&plan)?;
        self.check_cancel()?;
        self.run(&plan)?;
        if self.unpack_only {
            log::debug!("unpack_only set, stopping after run phase");
            return Ok(());
        }
        self.configure(&plan)?;
        Ok(())
    }

    /// Crash recovery: a pkg left `HalfUnpacked` by a prior run already has
    /// its file manifest and `requiredby` bookkeeping written, since
    /// `post_image_install` writes those before taking the `Unpacked` edge.
    /// Finishing it only needs a hash re-check against what's actually on
    /// disk and the two state edges it didn't get to take.
    fn resume_half_unpacked(&mut self) -> Result<(), Error> {
        let names: Vec<String> = self
            .pkgdb
            .half_state_pkgs()
            .into_iter()
            .filter(|p| p.state() == PkgState::HalfUnpacked)
            .filter_map(|p| p.pkgname().ok().map(str::to_string))
            .collect();

        for name in names {
            self.check_cancel()?;

            let files = self.pkgdb.get_pkg_files(&name).unwrap_or_default();
            for entry in &files.files {
                let path = self.rootdir.join(entry.file.trim_start_matches('/'));
                crate::verify::verify_sha256(&path, &entry.sha256)?;
            }

            let version = self
                .pkgdb
                .get_pkg(&name)
                .and_then(|p| p.version().ok())
                .unwrap_or_default()
                .to_string();
            let script = self.plugin.script_path(&self.metadir, &name, ScriptAction::Post);
            self.plugin.run(&script, &name, version.as_str(), ScriptAction::Post)?;

            self.pkgdb.set_pkg_state(&name, PkgState::Unpacked)?;
            self.pkgdb.set_pkg_state(&name, PkgState::Installed)?;
            self.pkgdb.flush()?;
        }
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    fn download(&self, plan: &TransactionPlan) -> Result<(), Error> {
        log::debug!("entering download phase, {} pkgs queued", plan.packages.len());
        self.state_cb.on_state(TransState::Download, StateDetail::Phase);
        std::fs::create_dir_all(&self.cachedir)?;

        let to_fetch: Vec<&TransactionOp> = plan.packages.iter().filter(|op| op.download).collect();
        let cancelled = AtomicBool::new(false);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);

        to_fetch.par_iter().for_each(|op| {
            if cancelled.load(Ordering::Relaxed) || self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.download_one(op) {
                if !cancelled.swap(true, Ordering::Relaxed) {
                    *first_error.lock().unwrap() = Some(e);
                }
            }
        });

        if let Some(e) = first_error.into_inner().unwrap() {
            return Err(e);
        }
        self.check_cancel()?;
        self.state_cb.on_state(TransState::Download, StateDetail::Phase);
        Ok(())
    }

    fn download_one(&self, op: &TransactionOp) -> Result<(), Error> {
        let pkgver = op.pkg.pkgver()?;
        self.state_cb.on_state(
            TransState::Download,
            StateDetail::Pkg { pkgver: pkgver.clone() },
        );

        let repo_uri = op
            .pkg
            .repository()
            .ok_or_else(|| Error::NotFound(op.pkgname.clone()))?;
        let filename = artifact_filename(op)?;
        let url = artifact_url(repo_uri, &filename)?;
        let fetcher = fetcher_for(&url)?;
        let progress_cb = |p: FetchProgress| self.state_cb.on_fetch(p);
        fetcher.fetch(&url, &self.cachedir, FetchFlags::none(), Some(&progress_cb))?;

        if self.repopool.repo_by_uri(repo_uri).map(|r| r.is_signed()).unwrap_or(false) {
            let sig_url = artifact_url(repo_uri, &format!("{filename}.sig2"))?;
            fetcher.fetch(&sig_url, &self.cachedir, FetchFlags::none(), None)?;
        }
        Ok(())
    }

    fn verify(&self, plan: &TransactionPlan) -> Result<(), Error> {
        log::debug!("entering verify phase");
        self.state_cb.on_state(TransState::Verify, StateDetail::Phase);

        let to_verify: Vec<&TransactionOp> = plan.packages.iter().filter(|op| op.download).collect();
        let cancelled = AtomicBool::new(false);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);

        to_verify.par_iter().for_each(|op| {
            if cancelled.load(Ordering::Relaxed) {
                return;
            }
            if let Err(e) = self.verify_one(op) {
                if !cancelled.swap(true, Ordering::Relaxed) {
                    *first_error.lock().unwrap() = Some(e);
                }
            }
        });

        if let Some(e) = first_error.into_inner().unwrap() {
            return Err(e);
        }
        self.state_cb.on_state(TransState::Verify, StateDetail::Phase);
        Ok(())
    }

    fn verify_one(&self, op: &TransactionOp) -> Result<(), Error> {
        let pkgver = op.pkg.pkgver()?;
        self.state_cb.on_state(TransState::Verify, StateDetail::Pkg { pkgver: pkgver.clone() });

        let filename = artifact_filename(op)?;
        let artifact_path = self.cachedir.join(&filename);
        let sig_path = self.cachedir.join(format!("{filename}.sig2"));

        let result = self.verify_one_inner(op, &artifact_path, &sig_path);
        if result.is_err() {
            let _ = std::fs::remove_file(&artifact_path);
            let _ = std::fs::remove_file(&sig_path);
        }
        result
    }

    fn verify_one_inner(&self, op: &TransactionOp, artifact_path: &Path, sig_path: &Path) -> Result<(), Error> {
        if let Some(expected) = op.pkg.filename_sha256() {
            verify_sha256(artifact_path, expected)?;
        }

        let Some(repo_uri) = op.pkg.repository() else { return Ok(()) };
        let Some(repo) = self.repopool.repo_by_uri(repo_uri) else { return Ok(()) };
        if !repo.is_signed() {
            return Ok(());
        }

        let der = repo
            .idxmeta()
            .public_key
            .as_ref()
            .ok_or_else(|| Error::Inval(format!("repository '{repo_uri}' has no stored public key")))?;
        let key = PublicKey::from_der(der)?;
        let signature = std::fs::read(sig_path)?;
        let payload = std::fs::read(artifact_path)?;
        key.verify(&payload, &signature)?;
        Ok(())
    }

    /// Rebuilds the conflict map one more time against the live filesystem,
    /// since a file may have appeared out-of-band since `prepare()` ran.
    fn collect_files(&self, plan: &TransactionPlan) -> Result<(), Error> {
        self.state_cb.on_state(TransState::Files, StateDetail::Phase);

        let removing: Vec<&str> = plan
            .packages
            .iter()
            .filter(|op| op.kind == TransKind::Remove)
            .map(|op| op.pkgname.as_str())
            .collect();

        let mut conflicts: Vec<String> = Vec::new();
        let mut claimed: BTreeMap<String, String> = BTreeMap::new();

        for op in &plan.packages {
            if op.kind == TransKind::Remove || !op.download {
                continue;
            }
            let filename = artifact_filename(op)?;
            let artifact_path = self.cachedir.join(&filename);
            let manifest = Archive::fetch_plist(&artifact_path, "files.plist")?;
            let files = Files::from_value(&manifest)?;

            for path in files.owned_paths() {
                if let Some(other) = claimed.insert(path.to_string(), op.pkgname.clone()) {
                    if other != op.pkgname {
                        conflicts.push(format!(
                            "file conflict on '{path}' between {} and {other}",
                            op.pkgname
                        ));
                    }
                    continue;
                }

                let live_exists = self.rootdir.join(path.trim_start_matches('/')).symlink_metadata().is_ok();
                if !live_exists {
                    continue;
                }
                let owned_by_self = self
                    .pkgdb
                    .get_pkg_files(&op.pkgname)
                    .map(|f| f.owned_paths().any(|p| p == path))
                    .unwrap_or(false);
                if owned_by_self {
                    continue;
                }
                let owned_by_other_installed = self.pkgdb.iter().any(|installed| {
                    let iname = installed.pkgname().unwrap_or_default();
                    iname != op.pkgname
                        && !removing.contains(&iname)
                        && self
                            .pkgdb
                            .get_pkg_files(iname)
                            .map(|f| f.owned_paths().any(|p| p == path))
                            .unwrap_or(false)
                });
                if !owned_by_other_installed {
                    conflicts.push(format!("file conflict on '{path}' exists on disk but is unowned"));
                }
            }
        }

        if !conflicts.is_empty() && !self.ignore_file_conflicts {
            return Err(Error::Again { conflicts });
        }
        self.state_cb.on_state(TransState::Files, StateDetail::Phase);
        Ok(())
    }

    fn run(&mut self, plan: &TransactionPlan) -> Result<(), Error> {
        log::debug!("entering run phase");
        self.state_cb.on_state(TransState::Run, StateDetail::Phase);
        for op in &plan.packages {
            self.check_cancel()?;
            match op.kind {
                TransKind::Remove => self.pre_image_teardown(&op.pkgname, &op.pkg, true)?,
                TransKind::Update => {
                    if let Some(installed) = self.pkgdb.get_pkg(&op.pkgname).cloned() {
                        self.pre_image_teardown(&op.pkgname, &installed, false)?;
                    }
                    self.post_image_install(op)?;
                }
                TransKind::Install | TransKind::Reinstall => self.post_image_install(op)?,
                TransKind::Configure => {}
            }
        }
        self.state_cb.on_state(TransState::Run, StateDetail::Phase);
        Ok(())
    }

    /// `REMOVE`/`UPDATE` pre-image teardown: half-removes the installed
    /// package's files and runs its `REMOVE remove` script. `drop_from_pkgdb`
    /// is false for an update's pre-image, since `post_image_install` is
    /// about to overwrite the entry with the new version anyway.
    fn pre_image_teardown(&mut self, pkgname: &str, pkg: &Pkg, drop_from_pkgdb: bool) -> Result<(), Error> {
        let pkgver = pkg.pkgver()?;
        self.state_cb.on_state(TransState::Run, StateDetail::Pkg { pkgver });

        self.pkgdb.set_pkg_state(pkgname, PkgState::HalfRemoved)?;
        self.pkgdb.flush()?;

        let files = self.pkgdb.get_pkg_files(pkgname).unwrap_or_default();
        for entry in &files.files {
            if self.is_kept_on_removal(&entry.file, pkg) {
                continue;
            }
            let _ = std::fs::remove_file(self.rootdir.join(entry.file.trim_start_matches('/')));
        }
        for entry in &files.conf_files {
            let path = self.rootdir.join(entry.file.trim_start_matches('/'));
            // A locally modified conf file is left on disk; only a pristine
            // copy (hash still matches the manifest) is removed, unless
            // force_remove_files overrides the hash check.
            let pristine = crate::verify::sha256_file(&path).map(|h| h.eq_ignore_ascii_case(&entry.sha256)).unwrap_or(false);
            if pristine || self.force_remove_files {
                let _ = std::fs::remove_file(&path);
            }
        }
        for entry in &files.links {
            if self.is_kept_on_removal(&entry.file, pkg) {
                continue;
            }
            let _ = std::fs::remove_file(self.rootdir.join(entry.file.trim_start_matches('/')));
        }
        for entry in files.dirs.iter().rev() {
            let _ = std::fs::remove_dir(self.rootdir.join(entry.file.trim_start_matches('/')));
        }

        for dep_name in self.run_dependency_names(pkg) {
            if let Some(dep) = self.pkgdb.get_pkg_mut(&dep_name) {
                if let Ok(pv) = pkg.pkgver() {
                    dep.remove_requiredby(&pv);
                }
            }
        }

        let script = self.plugin.script_path(&self.metadir, pkgname, ScriptAction::Remove);
        let version = pkg.version().unwrap_or_default();
        self.plugin.run(&script, pkgname, version, ScriptAction::Remove)?;

        if drop_from_pkgdb {
            self.pkgdb.remove(pkgname);
            self.pkgdb.flush()?;
        }
        Ok(())
    }

    fn is_kept_on_removal(&self, file: &str, pkg: &Pkg) -> bool {
        pkg.preserve()
            || self.preserved_files.iter().any(|pat| glob_match(pat, file))
            || self.noextract.iter().any(|pat| glob_match(pat, file))
    }

    fn run_dependency_names(&self, pkg: &Pkg) -> Vec<String> {
        pkg.run_depends()
            .map(|deps| deps.iter().map(|d| d.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// `INSTALL`/`UPDATE` post-image/`REINSTALL`: extracts the artifact,
    /// hashing each emitted entry into a fresh [`Files`] manifest.
    fn post_image_install(&mut self, op: &TransactionOp) -> Result<(), Error> {
        let pkgver = op.pkg.pkgver()?;
        self.state_cb.on_state(TransState::Run, StateDetail::Pkg { pkgver: pkgver.clone() });

        let mut installed_pkg = op.pkg.clone();
        installed_pkg.set_state(PkgState::HalfUnpacked);
        installed_pkg.set_automatic_install(op.automatic);
        self.pkgdb.insert(installed_pkg)?;
        self.pkgdb.flush()?;

        let script = self.plugin.script_path(&self.metadir, &op.pkgname, ScriptAction::Pre);
        let version = op.pkg.version().unwrap_or_default();
        self.plugin.run(&script, &op.pkgname, version, ScriptAction::Pre)?;

        let filename = artifact_filename(op)?;
        let artifact_path = self.cachedir.join(&filename);
        let files = self.extract(&artifact_path, op, &pkgver)?;
        self.pkgdb.set_pkg_files(&op.pkgname, &files)?;

        for dep_name in self.run_dependency_names(&op.pkg) {
            if let Some(dep) = self.pkgdb.get_pkg_mut(&dep_name) {
                dep.add_requiredby(&pkgver);
            }
        }

        self.pkgdb.set_pkg_state(&op.pkgname, PkgState::Unpacked)?;
        self.pkgdb.flush()?;
        Ok(())
    }

    fn extract(&self, artifact_path: &Path, op: &TransactionOp, pkgver: &str) -> Result<Files, Error> {
        let mut files = Files::default();
        let mut entries_done = 0u64;
        let mut iter = Archive::iter(artifact_path)?;

        iter.for_each(|meta, reader| {
            let normalized = meta.path.trim_start_matches("./").trim_start_matches('/').to_string();
            if normalized.is_empty() || normalized == "props.plist" || normalized == "files.plist" {
                return Ok(());
            }
            if !op.replace_files_in_pkg_update && self.noextract.iter().any(|pat| glob_match(pat, &normalized)) {
                return Ok(());
            }

            entries_done += 1;
            self.state_cb.on_unpack(UnpackProgress {
                pkgver: pkgver.to_string(),
                entries_total: 0,
                entries_done,
            });

            let dest = self.rootdir.join(&normalized);
            let recorded = format!("/{normalized}");

            if meta.is_dir {
                std::fs::create_dir_all(&dest)?;
                files.dirs.push(DirEntry { file: recorded, mode: Some(meta.mode) });
                return Ok(());
            }
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if meta.is_symlink {
                let target = meta.link_name.clone().unwrap_or_default();
                let _ = std::fs::remove_file(&dest);
                std::os::unix::fs::symlink(&target, &dest)?;
                let sha256 = if target.is_empty() { None } else { Some(sha256_of(target.as_bytes())) };
                files.links.push(LinkEntry { file: recorded, target, sha256 });
                return Ok(());
            }

            let mut out = std::fs::File::create(&dest)?;
            let mut hasher = StreamingSha256::new();
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
                hasher.update(&buf[..n]);
            }
            out.sync_all()?;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(meta.mode))?;

            files.files.push(FileEntry {
                file: recorded,
                sha256: hasher.finalize_hex(),
                size: None,
                mode: Some(meta.mode),
            });
            Ok(())
        })?;

        Ok(files)
    }

    /// For every freshly unpacked pkg, runs `INSTALL post` and transitions
    /// it to `INSTALLED`, in `transd.packages` order so a pkg's script can
    /// call tools its own dependencies just installed.
    fn configure(&mut self, plan: &TransactionPlan) -> Result<(), Error> {
        log::debug!("entering configure phase");
        self.state_cb.on_state(TransState::Configure, StateDetail::Phase);
        for op in &plan.packages {
            if op.kind == TransKind::Remove {
                continue;
            }
            self.check_cancel()?;

            let pkgver = op.pkg.pkgver()?;
            self.state_cb.on_state(TransState::Configure, StateDetail::Pkg { pkgver });

            let script = self.plugin.script_path(&self.metadir, &op.pkgname, ScriptAction::Post);
            let version = op.pkg.version().unwrap_or_default();
            self.plugin.run(&script, &op.pkgname, version, ScriptAction::Post)?;

            // A Configure-kind op never left `Installed`, so there is no edge
            // to drive; every other kind just unpacked and must advance.
            if op.kind != TransKind::Configure {
                self.pkgdb.set_pkg_state(&op.pkgname, PkgState::Installed)?;
                self.pkgdb.flush()?;
            }
        }
        self.state_cb.on_state(TransState::Configure, StateDetail::Phase);
        Ok(())
    }
}

fn artifact_filename(op: &TransactionOp) -> Result<String, Error> {
    let pkgver = op.pkg.pkgver()?;
    let arch = op.pkg.architecture()?;
    Ok(format!("{pkgver}.{arch}.xbps"))
}

fn artifact_url(repo_uri: &str, filename: &str) -> Result<Url, Error> {
    Url::parse(&format!("{}/{filename}", repo_uri.trim_end_matches('/')))
        .map_err(|e| Error::Inval(e.to_string()))
}

fn sha256_of(bytes: &[u8]) -> String {
    let mut hasher = StreamingSha256::new();
    hasher.update(bytes);
    hasher.finalize_hex()
}

/// Matches `noextract`/`preserve` config entries, which use shell-style
/// `*`/`?` globs rather than full fnmatch, against a manifest path.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pat: &[u8], text: &[u8]) -> bool {
        match (pat.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&pat[1..], text) || (!text.is_empty() && inner(pat, &text[1..])),
            (Some(b'?'), Some(_)) => inner(&pat[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => inner(&pat[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
#[path = "executor.test.rs"]
mod test;
