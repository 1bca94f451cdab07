use std::collections::HashSet;

use bitmask_enum::bitmask;
use thiserror::Error;

use crate::pkg::Pkg;
use crate::repo::Repo;
use crate::version::Pattern;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepoPoolError {
    #[error("the repository pool is empty")]
    NotSupported,

    #[error("no repository has '{0}'")]
    NotFound(String),

    #[error("unresolved shared-library requirement '{0}'")]
    NoExec(String),
}

/// Pool-wide query flags; `Bestmatch` is the only one consulted by RepoPool
/// itself (the rest of Handle's bitset governs Executor/TransactionBuilder
/// behavior).
#[bitmask(u8)]
pub enum PoolFlags {
    Bestmatch,
}

/// An ordered collection of [`Repo`]s, implementing the design's
/// "best match" / "virtual match" / reverse-dep queries.
#[derive(Default)]
pub struct RepoPool {
    repos: Vec<Repo>,
}

impl RepoPool {
    pub fn new() -> Self {
        RepoPool { repos: Vec::new() }
    }

    /// Adds a repo at the end (lowest precedence so far); callers build the
    /// pool in the order `Handle.repositories` lists them.
    pub fn push(&mut self, repo: Repo) {
        self.repos.push(repo);
    }

    pub fn repos(&self) -> &[Repo] {
        &self.repos
    }

    /// Finds the repo owning `uri`, for resolving a pkg's `repository` field
    /// back to its signing key during artifact verification.
    pub fn repo_by_uri(&self, uri: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.uri == uri)
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    /// Real package lookup. Without `Bestmatch`, returns the first pool-order
    /// repo with a match; with it, walks every repo and returns the overall
    /// greatest version.
    pub fn get_pkg(&self, pattern: &Pattern, flags: PoolFlags) -> Result<&Pkg, RepoPoolError> {
        if self.repos.is_empty() {
            return Err(RepoPoolError::NotSupported);
        }

        if flags.contains(PoolFlags::Bestmatch) {
            self.repos
                .iter()
                .filter_map(|r| r.get_pkg(pattern))
                .max_by(|a, b| {
                    crate::version::cmpver(
                        a.version().unwrap_or_default(),
                        b.version().unwrap_or_default(),
                    )
                })
                .ok_or_else(|| RepoPoolError::NotFound(pattern.name().to_string()))
        } else {
            self.repos
                .iter()
                .find_map(|r| r.get_pkg(pattern))
                .ok_or_else(|| RepoPoolError::NotFound(pattern.name().to_string()))
        }
    }

    /// Matches a pkg's `provides` list, in pool order; `virtualpkgs` override
    /// mappings (configured on Handle) are consulted by the caller before
    /// falling back to this method, per "preferring a configured mapping
    /// over any provider".
    pub fn get_virtualpkg(&self, pattern: &Pattern) -> Result<&Pkg, RepoPoolError> {
        if self.repos.is_empty() {
            return Err(RepoPoolError::NotSupported);
        }
        self.repos
            .iter()
            .find_map(|r| r.get_virtualpkg(pattern))
            .ok_or_else(|| RepoPoolError::NotFound(pattern.name().to_string()))
    }

    /// Union, across all repos, of packages whose `run_depends` is satisfied
    /// by `pkgver` or by any of its `provides` names.
    pub fn get_pkg_revdeps(&self, pkgver: &str) -> Vec<&Pkg> {
        self.repos
            .iter()
            .flat_map(Repo::iter)
            .filter(|candidate| {
                candidate
                    .run_depends()
                    .map(|deps| deps.iter().any(|d| d.matches(pkgver)))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Topologically sorted closure (leaves first) of `pkgver`'s
    /// dependencies across the pool, for display only (never used to build
    /// a transaction).
    pub fn get_pkg_fulldeptree(&self, pkgver: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        self.visit_deptree(pkgver, &mut visited, &mut order);
        order
    }

    fn visit_deptree(&self, pkgver: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(pkgver.to_string()) {
            return;
        }
        let name = crate::version::pkg_name(pkgver);
        if let Some(pkg) = self.repos.iter().find_map(|r| r.get_pkg_by_name(name)) {
            if let Ok(deps) = pkg.run_depends() {
                for dep in deps.iter() {
                    if let Ok(pattern) = dep.to_string().parse::<Pattern>() {
                        if let Ok(resolved) = self.get_pkg(&pattern, PoolFlags::none()) {
                            if let Ok(pv) = resolved.pkgver() {
                                self.visit_deptree(&pv, visited, order);
                            }
                        }
                    }
                }
            }
        }
        order.push(pkgver.to_string());
    }
}

#[cfg(test)]
#[path = "repopool.test.rs"]
mod test;
