use std::collections::BTreeMap;

use thiserror::Error;

use crate::dependency::{Dependencies, DependencyError};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum PkgError {
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("key '{key}' has the wrong type (expected {expected})")]
    WrongType { key: &'static str, expected: &'static str },

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("illegal state transition {from:?} -> {to:?}")]
    IllegalTransition { from: PkgState, to: PkgState },
}

/// The per-package state machine the design fixes in §3. `HalfUnpacked` and
/// `HalfRemoved` are the only intermediate states durably written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PkgState {
    NotInstalled,
    HalfUnpacked,
    Unpacked,
    Installed,
    HalfRemoved,
}

impl PkgState {
    pub fn as_str(self) -> &'static str {
        match self {
            PkgState::NotInstalled => "not-installed",
            PkgState::HalfUnpacked => "half-unpacked",
            PkgState::Unpacked => "unpacked",
            PkgState::Installed => "installed",
            PkgState::HalfRemoved => "half-removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "not-installed" => PkgState::NotInstalled,
            "half-unpacked" => PkgState::HalfUnpacked,
            "unpacked" => PkgState::Unpacked,
            "installed" => PkgState::Installed,
            "half-removed" => PkgState::HalfRemoved,
            _ => return None,
        })
    }

    /// Is the edge `self -> to` one of the transitions drawn in the design's
    /// state diagram?
    pub fn can_transition_to(self, to: PkgState) -> bool {
        use PkgState::*;
        matches!(
            (self, to),
            (NotInstalled, HalfUnpacked)
                | (HalfUnpacked, Unpacked)
                | (Unpacked, Installed)
                | (Installed, HalfRemoved)
                | (HalfRemoved, NotInstalled)
                | (HalfRemoved, HalfUnpacked) // retry edge drawn in the diagram
        )
    }
}

/// An immutable KV bundle over a [`Value::Dict`], mirroring how the teacher
/// layers typed struct accessors over parsed key-value pairs: validated
/// getters, not a class hierarchy per entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Pkg(pub BTreeMap<String, Value>);

impl Pkg {
    pub fn new(pkgname: &str, version: &str, architecture: &str) -> Self {
        let mut dict = BTreeMap::new();
        dict.insert("pkgname".to_string(), Value::Str(pkgname.to_string()));
        dict.insert("version".to_string(), Value::Str(version.to_string()));
        dict.insert(
            "architecture".to_string(),
            Value::Str(architecture.to_string()),
        );
        Pkg(dict)
    }

    pub fn from_value(value: Value) -> Result<Self, PkgError> {
        match value {
            Value::Dict(d) => Ok(Pkg(d)),
            _ => Err(PkgError::WrongType {
                key: "<root>",
                expected: "dict",
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Dict(self.0.clone())
    }

    fn str_field(&self, key: &'static str) -> Result<&str, PkgError> {
        self.0
            .get(key)
            .ok_or(PkgError::MissingKey(key))?
            .as_str()
            .ok_or(PkgError::WrongType { key, expected: "string" })
    }

    fn opt_str_field(&self, key: &'static str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn opt_bool_field(&self, key: &'static str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn opt_deps_field(&self, key: &'static str) -> Result<Dependencies, PkgError> {
        match self.0.get(key) {
            Some(v) => Ok(Dependencies::from_value(v)?),
            None => Ok(Dependencies::default()),
        }
    }

    pub fn pkgname(&self) -> Result<&str, PkgError> {
        self.str_field("pkgname")
    }

    pub fn version(&self) -> Result<&str, PkgError> {
        self.str_field("version")
    }

    /// `pkgver = pkgname-version`, matching the universal invariant in
    /// spec §8.
    pub fn pkgver(&self) -> Result<String, PkgError> {
        Ok(format!("{}-{}", self.pkgname()?, self.version()?))
    }

    pub fn architecture(&self) -> Result<&str, PkgError> {
        self.str_field("architecture")
    }

    pub fn short_desc(&self) -> Option<&str> {
        self.opt_str_field("short_desc")
    }

    pub fn run_depends(&self) -> Result<Dependencies, PkgError> {
        self.opt_deps_field("run_depends")
    }

    pub fn shlib_requires(&self) -> Result<Dependencies, PkgError> {
        self.opt_deps_field("shlib-requires")
    }

    pub fn shlib_provides(&self) -> Result<Dependencies, PkgError> {
        self.opt_deps_field("shlib-provides")
    }

    pub fn provides(&self) -> Result<Dependencies, PkgError> {
        self.opt_deps_field("provides")
    }

    pub fn replaces(&self) -> Result<Dependencies, PkgError> {
        self.opt_deps_field("replaces")
    }

    pub fn conflicts(&self) -> Result<Dependencies, PkgError> {
        self.opt_deps_field("conflicts")
    }

    pub fn reverts(&self) -> Vec<&str> {
        match self.0.get("reverts").and_then(Value::as_array) {
            Some(items) => items.iter().filter_map(Value::as_str).collect(),
            None => Vec::new(),
        }
    }

    pub fn installed_size(&self) -> u64 {
        self.0.get("installed_size").and_then(Value::as_uint).unwrap_or(0)
    }

    pub fn filename_size(&self) -> u64 {
        self.0.get("filename-size").and_then(Value::as_uint).unwrap_or(0)
    }

    pub fn filename_sha256(&self) -> Option<&str> {
        self.opt_str_field("filename-sha256")
    }

    pub fn automatic_install(&self) -> bool {
        self.opt_bool_field("automatic-install")
    }

    pub fn set_automatic_install(&mut self, value: bool) {
        self.0
            .insert("automatic-install".to_string(), Value::Bool(value));
    }

    pub fn preserve(&self) -> bool {
        self.opt_bool_field("preserve")
    }

    pub fn hold(&self) -> bool {
        self.opt_bool_field("hold")
    }

    pub fn repolock(&self) -> bool {
        self.opt_bool_field("repolock")
    }

    pub fn repository(&self) -> Option<&str> {
        self.opt_str_field("repository")
    }

    pub fn set_repository(&mut self, uri: &str) {
        self.0
            .insert("repository".to_string(), Value::Str(uri.to_string()));
    }

    pub fn state(&self) -> PkgState {
        self.opt_str_field("state")
            .and_then(PkgState::parse)
            .unwrap_or(PkgState::NotInstalled)
    }

    pub fn set_state(&mut self, state: PkgState) {
        self.0
            .insert("state".to_string(), Value::Str(state.as_str().to_string()));
    }

    pub fn requiredby(&self) -> Vec<&str> {
        match self.0.get("requiredby").and_then(Value::as_array) {
            Some(items) => items.iter().filter_map(Value::as_str).collect(),
            None => Vec::new(),
        }
    }

    pub fn add_requiredby(&mut self, pkgver: &str) {
        let entry = self
            .0
            .entry("requiredby".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            if !items.iter().any(|v| v.as_str() == Some(pkgver)) {
                items.push(Value::Str(pkgver.to_string()));
            }
        }
    }

    pub fn remove_requiredby(&mut self, pkgver: &str) {
        if let Some(Value::Array(items)) = self.0.get_mut("requiredby") {
            items.retain(|v| v.as_str() != Some(pkgver));
        }
    }
}

/// A regular file entry of a [`Files`] manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub file: String,
    pub sha256: String,
    pub size: Option<u64>,
    pub mode: Option<u32>,
}

/// A symlink entry; `sha256` is the hash of the link target string, absent
/// for an empty-target symlink (a warned-but-tolerated boundary case).
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEntry {
    pub file: String,
    pub target: String,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub file: String,
    pub mode: Option<u32>,
}

/// A regular file additionally marked as a config file: the manifest keeps
/// its original hash even after the file is modified on disk, per the
/// Executor's "conf_files with modified hash preserved" rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfFileEntry {
    pub file: String,
    pub sha256: String,
}

/// The per-package file manifest (`<metadir>/<pkgname>-files.plist`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Files {
    pub files: Vec<FileEntry>,
    pub links: Vec<LinkEntry>,
    pub dirs: Vec<DirEntry>,
    pub conf_files: Vec<ConfFileEntry>,
}

impl Files {
    pub fn from_value(value: &Value) -> Result<Self, PkgError> {
        let dict = value.as_dict().ok_or(PkgError::WrongType {
            key: "<root>",
            expected: "dict",
        })?;

        let files = dict
            .get("files")
            .and_then(Value::as_array)
            .unwrap_or(&[])
            .iter()
            .filter_map(|v| {
                let d = v.as_dict()?;
                Some(FileEntry {
                    file: d.get("file")?.as_str()?.to_string(),
                    sha256: d.get("sha256")?.as_str()?.to_string(),
                    size: d.get("size").and_then(Value::as_uint),
                    mode: d.get("mode").and_then(Value::as_uint).map(|m| m as u32),
                })
            })
            .collect();

        let links = dict
            .get("links")
            .and_then(Value::as_array)
            .unwrap_or(&[])
            .iter()
            .filter_map(|v| {
                let d = v.as_dict()?;
                Some(LinkEntry {
                    file: d.get("file")?.as_str()?.to_string(),
                    target: d.get("target")?.as_str().unwrap_or("").to_string(),
                    sha256: d.get("sha256").and_then(Value::as_str).map(str::to_string),
                })
            })
            .collect();

        let dirs = dict
            .get("dirs")
            .and_then(Value::as_array)
            .unwrap_or(&[])
            .iter()
            .filter_map(|v| {
                let d = v.as_dict()?;
                Some(DirEntry {
                    file: d.get("file")?.as_str()?.to_string(),
                    mode: d.get("mode").and_then(Value::as_uint).map(|m| m as u32),
                })
            })
            .collect();

        let conf_files = dict
            .get("conf_files")
            .and_then(Value::as_array)
            .unwrap_or(&[])
            .iter()
            .filter_map(|v| {
                let d = v.as_dict()?;
                Some(ConfFileEntry {
                    file: d.get("file")?.as_str()?.to_string(),
                    sha256: d.get("sha256")?.as_str()?.to_string(),
                })
            })
            .collect();

        Ok(Files { files, links, dirs, conf_files })
    }

    pub fn to_value(&self) -> Value {
        let mut dict = BTreeMap::new();

        dict.insert(
            "files".to_string(),
            Value::Array(
                self.files
                    .iter()
                    .map(|f| {
                        let mut d = BTreeMap::new();
                        d.insert("file".to_string(), Value::Str(f.file.clone()));
                        d.insert("sha256".to_string(), Value::Str(f.sha256.clone()));
                        if let Some(size) = f.size {
                            d.insert("size".to_string(), Value::UInt(size));
                        }
                        if let Some(mode) = f.mode {
                            d.insert("mode".to_string(), Value::UInt(mode as u64));
                        }
                        Value::Dict(d)
                    })
                    .collect(),
            ),
        );

        dict.insert(
            "links".to_string(),
            Value::Array(
                self.links
                    .iter()
                    .map(|l| {
                        let mut d = BTreeMap::new();
                        d.insert("file".to_string(), Value::Str(l.file.clone()));
                        d.insert("target".to_string(), Value::Str(l.target.clone()));
                        if let Some(sha256) = &l.sha256 {
                            d.insert("sha256".to_string(), Value::Str(sha256.clone()));
                        }
                        Value::Dict(d)
                    })
                    .collect(),
            ),
        );

        dict.insert(
            "dirs".to_string(),
            Value::Array(
                self.dirs
                    .iter()
                    .map(|e| {
                        let mut d = BTreeMap::new();
                        d.insert("file".to_string(), Value::Str(e.file.clone()));
                        if let Some(mode) = e.mode {
                            d.insert("mode".to_string(), Value::UInt(mode as u64));
                        }
                        Value::Dict(d)
                    })
                    .collect(),
            ),
        );

        dict.insert(
            "conf_files".to_string(),
            Value::Array(
                self.conf_files
                    .iter()
                    .map(|e| {
                        let mut d = BTreeMap::new();
                        d.insert("file".to_string(), Value::Str(e.file.clone()));
                        d.insert("sha256".to_string(), Value::Str(e.sha256.clone()));
                        Value::Dict(d)
                    })
                    .collect(),
            ),
        );

        Value::Dict(dict)
    }

    /// All paths this package claims ownership of (files, links, conf_files;
    /// not directories, which may be shared between packages).
    pub fn owned_paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .map(|f| f.file.as_str())
            .chain(self.links.iter().map(|l| l.file.as_str()))
            .chain(self.conf_files.iter().map(|f| f.file.as_str()))
    }
}

#[cfg(test)]
#[path = "pkg.test.rs"]
mod test;
