use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::error::Error;
use crate::pkg::{Pkg, PkgError};
use crate::pkgdb::Pkgdb;
use crate::repopool::{PoolFlags, RepoPool};
use crate::version::{cmpver, Pattern, VersionParseError};

#[derive(Debug, Error)]
pub enum TransactionError {
    /// A cycle in `run_depends` among the packages being ordered; a
    /// repository-data bug, never silently broken.
    #[error("dependency cycle detected among: {0:?}")]
    Cycle(Vec<String>),

    #[error(transparent)]
    Pkg(#[from] PkgError),

    #[error(transparent)]
    Pattern(#[from] VersionParseError),
}

/// The kind stored on each finished op, per the design's transaction-type
/// tags (`CONFIGURE`/`HOLD`/`DOWNLOAD` are carried as the `hold`/`download`
/// booleans and the `Configure` kind rather than as separate tags, since at
/// most one primary kind applies to a given op).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransKind {
    Install,
    Reinstall,
    Update,
    Remove,
    Configure,
}

/// One finished entry of a [`TransactionPlan`].
#[derive(Debug, Clone)]
pub struct TransactionOp {
    pub pkgname: String,
    pub kind: TransKind,
    /// The repo-side pkg for Install/Update/Reinstall/Configure, or the
    /// installed-side pkg for Remove.
    pub pkg: Pkg,
    pub automatic: bool,
    pub download: bool,
    pub hold: bool,
    pub replace_files_in_pkg_update: bool,
}

/// The resolved, ordered transaction, ready for [`crate::executor::Executor`].
#[derive(Debug, Clone, Default)]
pub struct TransactionPlan {
    pub packages: Vec<TransactionOp>,
}

impl TransactionPlan {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[derive(Debug, Clone)]
enum QueuedIntent {
    Install { pattern: Pattern, force: bool, automatic: bool },
    Update { name: String, force: bool },
    Remove { name: String, recursive: bool },
    Autoremove,
    Reconfigure { name: String },
}

/// Resolves a working set of install/update/remove intents into an ordered
/// [`TransactionPlan`], per the design's nine-step `prepare()` algorithm.
pub struct TransactionBuilder<'a> {
    pkgdb: &'a Pkgdb,
    repopool: &'a RepoPool,
    virtualpkgs: &'a [crate::config::VirtualPkgOverride],
    pool_flags: PoolFlags,
    ignore_file_conflicts: bool,
    force_unpack: bool,
    rootdir: PathBuf,
    self_pkgname: String,
    working: Vec<QueuedIntent>,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(
        pkgdb: &'a Pkgdb,
        repopool: &'a RepoPool,
        virtualpkgs: &'a [crate::config::VirtualPkgOverride],
        pool_flags: PoolFlags,
        ignore_file_conflicts: bool,
        force_unpack: bool,
        rootdir: &Path,
    ) -> Self {
        TransactionBuilder {
            pkgdb,
            repopool,
            virtualpkgs,
            pool_flags,
            ignore_file_conflicts,
            force_unpack,
            rootdir: rootdir.to_path_buf(),
            self_pkgname: "xbps".to_string(),
            working: Vec::new(),
        }
    }

    pub fn install_pkg(&mut self, pattern: &Pattern, force: bool) -> Result<(), Error> {
        if !force && self.pkgdb.contains(pattern.name()) {
            return Err(Error::Exists(pattern.name().to_string()));
        }
        self.working.push(QueuedIntent::Install {
            pattern: pattern.clone(),
            force,
            automatic: false,
        });
        Ok(())
    }

    pub fn update_pkg(&mut self, name: &str, force: bool) -> Result<(), Error> {
        let installed = self
            .pkgdb
            .get_pkg(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let installed_version = installed.version().map_err(TransactionError::from)?.to_string();

        let pattern = any_version(name);
        let repo_pkg = self
            .repopool
            .get_pkg(&pattern, self.pool_flags)
            .map_err(|_| Error::NotFound(name.to_string()))?;
        let repo_version = repo_pkg.version().map_err(TransactionError::from)?;

        let not_an_upgrade = cmpver(repo_version, &installed_version) != std::cmp::Ordering::Greater
            && !reverts_match(repo_pkg, repo_version, installed, &installed_version);
        if !force && not_an_upgrade {
            return Err(Error::Exists(name.to_string()));
        }

        self.working.push(QueuedIntent::Update {
            name: name.to_string(),
            force,
        });
        Ok(())
    }

    /// Applies [`Self::update_pkg`] to every non-held installed pkg,
    /// silently skipping ones already at the best available version.
    pub fn update_packages(&mut self) -> Result<(), Error> {
        let names: Vec<String> = self
            .pkgdb
            .iter()
            .filter(|p| !p.hold())
            .filter_map(|p| p.pkgname().ok().map(str::to_string))
            .collect();
        for name in names {
            match self.update_pkg(&name, false) {
                Ok(()) | Err(Error::Exists(_)) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn remove_pkg(&mut self, name: &str, recursive: bool) -> Result<(), Error> {
        if !self.pkgdb.contains(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        self.working.push(QueuedIntent::Remove {
            name: name.to_string(),
            recursive,
        });
        Ok(())
    }

    /// Enqueues every orphan: an automatically-installed pkg that nothing
    /// remaining requires.
    pub fn autoremove_pkgs(&mut self) {
        self.working.push(QueuedIntent::Autoremove);
    }

    /// Re-runs an already-installed pkg's `INSTALL post` script without
    /// touching its files, producing the `CONFIGURE` tag the design names
    /// alongside `INSTALL`/`UPDATE`/`REMOVE`/`REINSTALL`.
    pub fn reconfigure_pkg(&mut self, name: &str) -> Result<(), Error> {
        if !self.pkgdb.contains(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        self.working.push(QueuedIntent::Reconfigure { name: name.to_string() });
        Ok(())
    }

    fn resolve_virtual(&self, pattern: &Pattern) -> Option<String> {
        if let Some(over) = self.virtualpkgs.iter().find(|v| v.name == pattern.name()) {
            return Some(over.realpkgver.clone());
        }
        self.repopool
            .get_virtualpkg(pattern)
            .ok()
            .and_then(|pkg| pkg.pkgver().ok())
    }

    fn resolve_candidate(&self, pattern: &Pattern) -> Option<Pkg> {
        if let Ok(pkg) = self.repopool.get_pkg(pattern, self.pool_flags) {
            return Some(pkg.clone());
        }
        let realpkgver = self.resolve_virtual(pattern)?;
        let real_pattern = Pattern::from_str(&realpkgver).ok()?;
        self.repopool.get_pkg(&real_pattern, self.pool_flags).ok().cloned()
    }

    /// Walks `root`'s `run_depends` closure, adding any automatically
    /// installed dependency to `explicit_removes` once every pkgver in its
    /// `requiredby` list is itself already slated for removal. Runs to a
    /// fixpoint so removing a leaf can cascade through several levels of
    /// now-orphaned dependencies, e.g. a pkg whose sole dependent is another
    /// orphan removed earlier in the same pass.
    fn add_recursive_orphans(&self, root: &str, explicit_removes: &mut BTreeSet<String>) {
        let mut frontier = vec![root.to_string()];
        while let Some(name) = frontier.pop() {
            let Some(pkg) = self.pkgdb.get_pkg(&name) else { continue };
            let Ok(deps) = pkg.run_depends() else { continue };
            for dep in deps.iter() {
                let dep_name = dep.name().to_string();
                if explicit_removes.contains(&dep_name) {
                    continue;
                }
                let Some(dep_pkg) = self.pkgdb.get_pkg(&dep_name) else { continue };
                if !dep_pkg.automatic_install() {
                    continue;
                }
                let still_required = dep_pkg.requiredby().iter().any(|r| {
                    let rname = crate::version::pkg_name(r);
                    !explicit_removes.contains(rname)
                });
                if !still_required {
                    explicit_removes.insert(dep_name.clone());
                    frontier.push(dep_name);
                }
            }
        }
    }

    fn targets_self_update(&self) -> bool {
        self.working.iter().any(|intent| match intent {
            QueuedIntent::Install { pattern, .. } => pattern.name() == self.self_pkgname,
            QueuedIntent::Update { name, .. } => name == &self.self_pkgname,
            _ => false,
        })
    }

    /// Step 0 (ADDED): if the package manager itself has a pending update
    /// and nothing in the working set already targets it, abort so the
    /// embedder can run the self-update first.
    fn check_self_update(&self) -> Result<(), Error> {
        if self.targets_self_update() {
            return Ok(());
        }
        let Some(installed) = self.pkgdb.get_pkg(&self.self_pkgname) else {
            return Ok(());
        };
        let Ok(installed_version) = installed.version() else {
            return Ok(());
        };
        let pattern = any_version(&self.self_pkgname);
        if let Ok(repo_pkg) = self.repopool.get_pkg(&pattern, self.pool_flags) {
            if let Ok(repo_version) = repo_pkg.version() {
                if cmpver(repo_version, installed_version) == std::cmp::Ordering::Greater {
                    return Err(Error::Busy);
                }
            }
        }
        Ok(())
    }

    /// Converts the working set into a [`TransactionPlan`], running the
    /// nine steps the design lays out.
    pub fn prepare(self) -> Result<TransactionPlan, Error> {
        self.check_self_update()?;

        let mut resolved: BTreeMap<String, TransactionOp> = BTreeMap::new();
        let mut missing_deps: Vec<String> = Vec::new();
        let mut queue: VecDeque<(Pattern, bool, bool)> = VecDeque::new();
        let mut remove_requests: Vec<(String, bool)> = Vec::new();
        let mut reconfigure_names: Vec<String> = Vec::new();
        let mut autoremove = false;

        for intent in &self.working {
            match intent {
                QueuedIntent::Install { pattern, force, automatic } => {
                    queue.push_back((pattern.clone(), *force, *automatic));
                }
                QueuedIntent::Update { name, force } => {
                    queue.push_back((any_version(name), *force, false));
                }
                QueuedIntent::Remove { name, recursive } => {
                    remove_requests.push((name.clone(), *recursive));
                }
                QueuedIntent::Autoremove => autoremove = true,
                QueuedIntent::Reconfigure { name } => reconfigure_names.push(name.clone()),
            }
        }

        // 1. Dependency closure.
        while let Some((pattern, force, automatic)) = queue.pop_front() {
            let name = pattern.name().to_string();
            if resolved.contains_key(&name) {
                continue;
            }

            let Some(repo_pkg) = self.resolve_candidate(&pattern) else {
                missing_deps.push(pattern.name().to_string());
                continue;
            };

            let kind = match self.pkgdb.get_pkg(&name) {
                Some(_) if force => TransKind::Reinstall,
                Some(installed) => {
                    let installed_version = installed.version().map_err(TransactionError::from)?;
                    let repo_version = repo_pkg.version().map_err(TransactionError::from)?;
                    if cmpver(repo_version, installed_version) == std::cmp::Ordering::Equal {
                        TransKind::Configure
                    } else {
                        TransKind::Update
                    }
                }
                None => TransKind::Install,
            };

            for dep in repo_pkg.run_depends().map_err(TransactionError::from)?.iter() {
                let dep_pattern = Pattern::from_str(&dep.to_string()).map_err(TransactionError::from)?;
                let satisfied = self
                    .pkgdb
                    .get_pkg(dep_pattern.name())
                    .map(|p| p.pkgver().map(|pv| dep_pattern.matches(&pv)).unwrap_or(false))
                    .unwrap_or(false)
                    || resolved.contains_key(dep_pattern.name());
                if !satisfied {
                    queue.push_back((dep_pattern, false, true));
                }
            }

            resolved.insert(
                name.clone(),
                TransactionOp {
                    pkgname: name,
                    kind,
                    pkg: repo_pkg,
                    automatic,
                    download: false,
                    hold: false,
                    replace_files_in_pkg_update: false,
                },
            );
        }

        if !missing_deps.is_empty() {
            missing_deps.sort();
            missing_deps.dedup();
            return Err(Error::NoDev { missing_deps });
        }

        // Reconfigure ops carry no dependency or file changes, so they skip
        // the closure above entirely and are inserted directly.
        for name in &reconfigure_names {
            if resolved.contains_key(name) {
                continue;
            }
            if let Some(installed) = self.pkgdb.get_pkg(name) {
                resolved.insert(
                    name.clone(),
                    TransactionOp {
                        pkgname: name.clone(),
                        kind: TransKind::Configure,
                        pkg: installed.clone(),
                        automatic: false,
                        download: false,
                        hold: false,
                        replace_files_in_pkg_update: false,
                    },
                );
            }
        }

        // 2. Reverts: the closure above has no version-direction gate of its
        // own, so a pkgname reaching it always becomes an `Update` op once
        // versions differ, revert or not. The actual gate `reverts` needs to
        // clear is `update_pkg`'s reject-unless-newer check, via
        // `reverts_match`; a dependency pulled in here (never passing through
        // `update_pkg`) is only ever an upgrade by construction, so it needs
        // no separate revert check.

        // 3. Replaces.
        let mut explicit_removes: BTreeSet<String> = BTreeSet::new();
        let incoming_names: Vec<String> = resolved.keys().cloned().collect();
        for name in &incoming_names {
            let op = resolved.get(name).unwrap();
            let replaces = op.pkg.replaces().map_err(TransactionError::from)?;
            if replaces.is_empty() {
                continue;
            }
            for installed in self.pkgdb.iter() {
                let Ok(pkgver) = installed.pkgver() else { continue };
                if installed.pkgname().ok() == Some(name.as_str()) {
                    continue;
                }
                if replaces.iter().any(|d| d.matches(&pkgver)) {
                    let replaced_name = installed.pkgname().unwrap().to_string();
                    if let Some(replaced_op) = resolved.get_mut(&replaced_name) {
                        replaced_op.replace_files_in_pkg_update = true;
                    } else {
                        explicit_removes.insert(replaced_name);
                    }
                }
            }
        }

        // 4. Conflicts.
        let mut conflicts: Vec<String> = Vec::new();
        for name in &incoming_names {
            let op = resolved.get(name).unwrap();
            let pkg_conflicts = op.pkg.conflicts().map_err(TransactionError::from)?;
            if pkg_conflicts.is_empty() {
                continue;
            }
            for other_name in resolved.keys() {
                if other_name == name {
                    continue;
                }
                let other = &resolved[other_name];
                if let Ok(pv) = other.pkg.pkgver() {
                    if pkg_conflicts.iter().any(|d| d.matches(&pv)) {
                        conflicts.push(format!("{name} conflicts with {other_name}"));
                    }
                }
            }
            for installed in self.pkgdb.iter() {
                let Ok(pv) = installed.pkgver() else { continue };
                let iname = installed.pkgname().unwrap_or_default();
                if resolved.contains_key(iname) || explicit_removes.contains(iname) {
                    continue;
                }
                if pkg_conflicts.iter().any(|d| d.matches(&pv)) {
                    conflicts.push(format!("{name} conflicts with installed {iname}"));
                }
            }
        }

        // 4c. File conflicts. The full manifest for an incoming artifact
        // isn't known until it's downloaded and extracted (the Executor
        // redoes this scan against the live filesystem in its Files phase);
        // here we can only check what the repo index's pkg entry itself
        // carries, which still catches incoming-vs-incoming collisions and
        // obvious incoming-vs-installed ones ahead of the download.
        let mut claimed: BTreeMap<String, String> = BTreeMap::new();
        for name in &incoming_names {
            let files = crate::pkg::Files::from_value(&resolved[name].pkg.to_value()).unwrap_or_default();
            for path in files.owned_paths() {
                if let Some(other) = claimed.insert(path.to_string(), name.clone()) {
                    if other != *name {
                        conflicts.push(format!("file conflict on '{path}' between {name} and {other}"));
                    }
                }
            }
        }
        if !self.force_unpack {
            for name in &incoming_names {
                let files = crate::pkg::Files::from_value(&resolved[name].pkg.to_value()).unwrap_or_default();
                for path in files.owned_paths() {
                    for installed in self.pkgdb.iter() {
                        let iname = installed.pkgname().unwrap_or_default();
                        if iname == name || resolved.contains_key(iname) || explicit_removes.contains(iname) {
                            continue;
                        }
                        if let Ok(iowned) = self.pkgdb.get_pkg_files(iname) {
                            if iowned.owned_paths().any(|p| p == path) {
                                conflicts.push(format!("file conflict on '{path}' owned by installed {iname}"));
                            }
                        }
                    }
                }
            }
        }

        if !conflicts.is_empty() {
            return Err(Error::Again { conflicts });
        }

        // 5. Shared-library coherence.
        let mut missing_shlibs: Vec<String> = Vec::new();
        let mut provided: BTreeSet<String> = BTreeSet::new();
        for pkg in self.pkgdb.iter() {
            if explicit_removes.contains(pkg.pkgname().unwrap_or_default()) {
                continue;
            }
            if let Ok(deps) = pkg.shlib_provides() {
                provided.extend(deps.iter().map(|d| d.name().to_string()));
            }
        }
        for op in resolved.values() {
            if let Ok(deps) = op.pkg.shlib_provides() {
                provided.extend(deps.iter().map(|d| d.name().to_string()));
            }
        }
        for op in resolved.values() {
            if let Ok(deps) = op.pkg.shlib_requires() {
                for dep in deps.iter() {
                    if !provided.contains(dep.name()) {
                        missing_shlibs.push(dep.name().to_string());
                    }
                }
            }
        }
        if !missing_shlibs.is_empty() && !self.ignore_file_conflicts {
            missing_shlibs.sort();
            missing_shlibs.dedup();
            return Err(Error::NoExec { missing_shlibs });
        }

        // Materialize removes (explicit + replaced-without-update + recursive
        // orphans + autoremove).
        for (name, recursive) in &remove_requests {
            explicit_removes.insert(name.clone());
            if *recursive {
                self.add_recursive_orphans(name, &mut explicit_removes);
            }
        }
        if autoremove {
            for pkg in self.pkgdb.iter() {
                if pkg.automatic_install() && pkg.requiredby().is_empty() {
                    if let Ok(name) = pkg.pkgname() {
                        explicit_removes.insert(name.to_string());
                    }
                }
            }
        }

        for name in &explicit_removes {
            if resolved.contains_key(name) {
                continue;
            }
            if let Some(installed) = self.pkgdb.get_pkg(name) {
                resolved.insert(
                    name.clone(),
                    TransactionOp {
                        pkgname: name.clone(),
                        kind: TransKind::Remove,
                        pkg: installed.clone(),
                        automatic: false,
                        download: false,
                        hold: false,
                        replace_files_in_pkg_update: false,
                    },
                );
            }
        }

        // 6. Disk-space check.
        let mut net_size: i64 = 0;
        for op in resolved.values() {
            let pre_image_size = self.pkgdb.get_pkg(&op.pkgname).map(Pkg::installed_size).unwrap_or(0);
            match op.kind {
                TransKind::Remove => net_size -= pre_image_size as i64,
                TransKind::Update | TransKind::Reinstall => {
                    net_size += op.pkg.installed_size() as i64 - pre_image_size as i64
                }
                _ => net_size += op.pkg.installed_size() as i64,
            }
        }
        if net_size > 0 {
            let free = disk_free_size(&self.rootdir);
            if (net_size as u64) > free {
                return Err(Error::NoSpc {
                    total_installed_size: net_size as u64,
                    disk_free_size: free,
                });
            }
        }

        // 7. Ordering: topological sort over run_depends, installs/updates
        // before their dependents, removes in the reverse order of the
        // install subgraph they correspond to.
        let mut installs: Vec<String> = resolved
            .values()
            .filter(|op| op.kind != TransKind::Remove)
            .map(|op| op.pkgname.clone())
            .collect();
        let install_order = toposort(&installs, &resolved)?;
        installs = install_order;

        let removes: Vec<String> = resolved
            .values()
            .filter(|op| op.kind == TransKind::Remove)
            .map(|op| op.pkgname.clone())
            .collect();
        let mut remove_order = toposort(&removes, &resolved)?;
        remove_order.reverse();

        let mut ordered_names = installs;
        ordered_names.extend(remove_order);

        // 8 & 9. Download flag + hold pass.
        let mut packages = Vec::with_capacity(ordered_names.len());
        for name in ordered_names {
            let mut op = resolved.remove(&name).unwrap();
            if op.kind != TransKind::Remove && op.kind != TransKind::Configure {
                op.download = true;
            }
            if op.kind != TransKind::Remove && self.pkgdb.get_pkg(&op.pkgname).map(Pkg::hold).unwrap_or(false) {
                op.hold = true;
            }
            packages.push(op);
        }

        Ok(TransactionPlan { packages })
    }
}

/// Step 2's revert check: a repo candidate numerically lower than (or equal
/// to) what's installed still counts as an upgrade if either side's
/// `reverts` list names the other's version.
fn reverts_match(repo_pkg: &Pkg, repo_version: &str, installed: &Pkg, installed_version: &str) -> bool {
    repo_pkg.reverts().iter().any(|v| *v == installed_version) || installed.reverts().iter().any(|v| *v == repo_version)
}

/// A pattern matching any version of `name`. `Pattern::from_str` on a bare
/// name with no operator or glob char falls through to `Exact`, which would
/// then require a literal full-pkgver match against just the name and never
/// hit — callers resolving an installed pkg's repo-side candidate by name
/// alone need this instead.
fn any_version(name: &str) -> Pattern {
    Pattern::Glob { name: name.to_string(), glob: format!("{name}-*") }
}

/// Free space available to unprivileged writers under `/`, consulted by
/// step 6's disk-space check. A failed `statvfs` is treated as
/// "unconstrained" rather than propagated, matching the design's framing
/// of this check as a soft guard rather than a hard precondition.
fn disk_free_size(rootdir: &Path) -> u64 {
    match nix::sys::statvfs::statvfs(rootdir) {
        Ok(stat) => stat.blocks_available() as u64 * stat.fragment_size(),
        Err(_) => u64::MAX,
    }
}

/// Kahn's algorithm over `run_depends` restricted to `names`; dependencies
/// before dependents. Missing edges (dependency outside this op set) are
/// ignored, since they are already satisfied by pkgdb.
fn toposort(
    names: &[String],
    resolved: &BTreeMap<String, TransactionOp>,
) -> Result<Vec<String>, TransactionError> {
    let name_set: BTreeSet<&String> = names.iter().collect();
    let mut indegree: BTreeMap<String, usize> = names.iter().map(|n| (n.clone(), 0)).collect();
    let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for name in names {
        let op = &resolved[name];
        let deps = op.pkg.run_depends()?;
        for dep in deps.iter() {
            let dep_name = dep.name().to_string();
            if name_set.contains(&dep_name) && &dep_name != name {
                edges.entry(dep_name).or_default().push(name.clone());
                *indegree.get_mut(name).unwrap() += 1;
            }
        }
    }

    let mut queue: VecDeque<String> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(n, _)| n.clone())
        .collect();
    let mut order = Vec::with_capacity(names.len());

    while let Some(n) = queue.pop_front() {
        if let Some(dependents) = edges.get(&n) {
            for dependent in dependents.clone() {
                let deg = indegree.get_mut(&dependent).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        order.push(n);
    }

    if order.len() != names.len() {
        let remaining: Vec<String> = names.iter().filter(|n| !order.contains(n)).cloned().collect();
        return Err(TransactionError::Cycle(remaining));
    }

    Ok(order)
}

#[cfg(test)]
#[path = "transaction.test.rs"]
mod test;
