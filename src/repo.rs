use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

use crate::archive::{Archive, ArchiveError};
use crate::fetch::{fetcher_for, FetchError, FetchFlags, Fetcher};
use crate::pkg::{Pkg, PkgError};
use crate::value::{Value, ValueError};
use crate::verify::{PublicKey, VerifyError};
use crate::version::Pattern;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Pkg(#[from] PkgError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid repository URI '{0}'")]
    InvalidUri(String),

    #[error("index entry for '{0}' has pkgname '{1}', violating the keyed-by-pkgname invariant")]
    KeyMismatch(String, String),

    #[error("repository metadata is not signed but a signature was requested")]
    NotSigned,
}

/// Signed metadata carried alongside a repo's index (`idxmeta`).
#[derive(Debug, Clone, Default)]
pub struct IdxMeta {
    pub public_key: Option<Vec<u8>>,
    pub public_key_size: Option<u64>,
    pub signature_by: Option<String>,
    pub signature_type: Option<String>,
}

impl IdxMeta {
    fn from_value(value: &Value) -> Self {
        let get_str = |k: &str| value.get(k).and_then(Value::as_str).map(str::to_string);
        IdxMeta {
            public_key: value.get("public-key").and_then(Value::as_data).map(<[u8]>::to_vec),
            public_key_size: value.get("public-key-size").and_then(Value::as_uint),
            signature_by: get_str("signature-by"),
            signature_type: get_str("signature-type"),
        }
    }
}

/// One repository's signed index + stage + metadata, loaded from
/// `<arch>-repodata` under a repo's local cache directory.
pub struct Repo {
    /// Origin URI, used as `repository` on every Pkg it hands out and as the
    /// tie-breaker in pool-order queries.
    pub uri: String,
    index: BTreeMap<String, Pkg>,
    stage: BTreeMap<String, Pkg>,
    idxmeta: IdxMeta,
}

impl Repo {
    /// Loads a repo from an already-fetched `index.plist`/`index-meta.plist`
    /// pair (both internalized documents, as produced by [`crate::archive`]
    /// or directly from disk for a `file://` repo).
    pub fn load(uri: &str, index: Value, stage: Option<Value>, idxmeta: Option<Value>) -> Result<Self, RepoError> {
        let index = Self::index_from_value(uri, index)?;
        let stage = match stage {
            Some(v) => Self::index_from_value(uri, v)?,
            None => BTreeMap::new(),
        };
        let idxmeta = idxmeta.as_ref().map(IdxMeta::from_value).unwrap_or_default();

        Ok(Repo { uri: uri.to_string(), index, stage, idxmeta })
    }

    fn index_from_value(uri: &str, value: Value) -> Result<BTreeMap<String, Pkg>, RepoError> {
        let dict = value.as_dict().cloned().unwrap_or_default();
        dict.into_iter()
            .map(|(name, v)| {
                let mut pkg = Pkg::from_value(v)?;
                pkg.set_repository(uri);
                if pkg.pkgname().unwrap_or_default() != name {
                    return Err(RepoError::KeyMismatch(
                        name,
                        pkg.pkgname().unwrap_or_default().to_string(),
                    ));
                }
                Ok((name, pkg))
            })
            .collect()
    }

    pub fn idxmeta(&self) -> &IdxMeta {
        &self.idxmeta
    }

    pub fn is_signed(&self) -> bool {
        self.idxmeta.signature_type.is_some()
    }

    /// Verifies `raw_index` (the undecoded `index.plist` bytes) against
    /// `signature` using this repo's stored public key.
    pub fn verify_signature(&self, raw_index: &[u8], signature: &[u8]) -> Result<(), RepoError> {
        let der = self
            .idxmeta
            .public_key
            .as_ref()
            .ok_or(RepoError::NotSigned)?;
        let key = PublicKey::from_der(der)?;
        key.verify(raw_index, signature)?;
        Ok(())
    }

    pub fn get_pkg_by_name(&self, name: &str) -> Option<&Pkg> {
        self.index.get(name)
    }

    pub fn get_stage_pkg_by_name(&self, name: &str) -> Option<&Pkg> {
        self.stage.get(name)
    }

    /// Looks up a package by pattern (exact, relational, or glob), returning
    /// the greatest matching version present in this repo's index.
    pub fn get_pkg(&self, pattern: &Pattern) -> Option<&Pkg> {
        self.index
            .values()
            .filter(|pkg| pkg.pkgname().ok() == Some(pattern.name()))
            .filter(|pkg| {
                pkg.pkgver()
                    .map(|pv| pattern.matches(&pv))
                    .unwrap_or(false)
            })
            .max_by(|a, b| {
                crate::version::cmpver(
                    a.version().unwrap_or_default(),
                    b.version().unwrap_or_default(),
                )
            })
    }

    /// Finds a package whose `provides` list satisfies `pattern` (a virtual
    /// name, optionally with its own version pattern).
    pub fn get_virtualpkg(&self, pattern: &Pattern) -> Option<&Pkg> {
        self.index.values().find(|pkg| {
            pkg.provides()
                .map(|deps| deps.iter().any(|d| d.name() == pattern.name()))
                .unwrap_or(false)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pkg> {
        self.index.values()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// The path `sync()` fetches `<arch>-repodata` into:
/// `<metadir>/<sanitized-uri>/`.
pub fn sanitized_cache_dir(metadir: &Path, uri: &str) -> PathBuf {
    let sanitized: String = uri
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    metadir.join(sanitized)
}

/// Where a trusted repo public key is pinned once imported, as documented on
/// [`PublicKey`].
fn trusted_key_path(metadir: &Path, fingerprint: &str) -> PathBuf {
    metadir.join("keys").join(format!("{fingerprint}.plist"))
}

fn load_trusted_key(metadir: &Path, fingerprint: &str) -> Result<Option<Vec<u8>>, RepoError> {
    let path = trusted_key_path(metadir, fingerprint);
    match Value::internalize_from_file(&path)? {
        Some(v) => Ok(v.get("public-key").and_then(Value::as_data).map(<[u8]>::to_vec)),
        None => Ok(None),
    }
}

fn store_trusted_key(metadir: &Path, fingerprint: &str, der: &[u8]) -> Result<(), RepoError> {
    let path = trusted_key_path(metadir, fingerprint);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut dict = BTreeMap::new();
    dict.insert("public-key".to_string(), Value::data(der.to_vec()));
    Value::Dict(dict).externalize_to_file(&path)?;
    Ok(())
}

impl Repo {
    /// Fetches `<arch>-repodata` for `uri` into its sanitized cache directory
    /// under `metadir`, verifies the index signature against the
    /// locally-pinned public key, and loads the result.
    ///
    /// The key pinned at the first successful sync of a repo (TOFU: trust on
    /// first use) is what later syncs verify against, not whatever key
    /// happens to come back in that sync's own `index-meta.plist` — a repo
    /// compromised after the fact can't just start signing with a new key.
    /// `on_notice` is called once for a first-time key import and once with
    /// the final outcome, matching the design's `StateDetail::Message` hook.
    pub fn sync(uri: &str, arch: &str, metadir: &Path, on_notice: &dyn Fn(String)) -> Result<Self, RepoError> {
        let base = uri.trim_end_matches('/');
        let fetcher = fetcher_for(&Url::parse(uri).map_err(|_| RepoError::InvalidUri(uri.to_string()))?)?;
        let cache_dir = sanitized_cache_dir(metadir, uri);
        std::fs::create_dir_all(&cache_dir)?;

        let repodata_url =
            Url::parse(&format!("{base}/{arch}-repodata")).map_err(|_| RepoError::InvalidUri(uri.to_string()))?;
        fetcher.fetch(&repodata_url, &cache_dir, FetchFlags::none(), None)?;
        let repodata_path = cache_dir.join(format!("{arch}-repodata"));

        let index = Archive::fetch_plist(&repodata_path, "index.plist")?;
        let idxmeta_value = Archive::fetch_plist(&repodata_path, "index-meta.plist")?;
        let idxmeta = IdxMeta::from_value(&idxmeta_value);

        if idxmeta.signature_type.as_deref() == Some("rsa") {
            let der = idxmeta
                .public_key
                .as_ref()
                .ok_or(RepoError::NotSigned)?;
            let key = PublicKey::from_der(der)?;
            let fingerprint = key.fingerprint();

            match load_trusted_key(metadir, &fingerprint)? {
                None => {
                    store_trusted_key(metadir, &fingerprint, der)?;
                    on_notice(format!("imported and now trusting public key '{fingerprint}' for repository '{uri}'"));
                }
                Some(trusted_der) => {
                    let trusted_key = PublicKey::from_der(&trusted_der)?;
                    let sig_url = Url::parse(&format!("{base}/{arch}-repodata.sig2"))
                        .map_err(|_| RepoError::InvalidUri(uri.to_string()))?;
                    fetcher.fetch(&sig_url, &cache_dir, FetchFlags::none(), None)?;
                    let sig_path = cache_dir.join(format!("{arch}-repodata.sig2"));
                    let signature = std::fs::read(&sig_path)?;
                    let raw_index = index.externalize()?;
                    trusted_key.verify(raw_index.as_bytes(), &signature)?;
                }
            }
        }

        let repo = Self::load(uri, index, None, Some(idxmeta_value))?;
        on_notice(format!("synced repository '{uri}': {} packages", repo.len()));
        Ok(repo)
    }
}

#[cfg(test)]
#[path = "repo.test.rs"]
mod test;
