use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("syntax error on line {0}: missing '=' in '{1}'")]
    Syntax(usize, String),

    #[error("malformed virtualpkg entry '{0}', expected name=realpkgver")]
    MalformedVirtualpkg(String),
}

/// One `<name>=<realpkgver>` override, the `virtualpkg` config key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPkgOverride {
    pub name: String,
    pub realpkgver: String,
}

/// The fields an `xbps.d` fragment can populate on a [`crate::handle::Handle`].
/// Later-merged fragments only append; precedence among `repository` entries
/// is "earliest wins", matching "first has highest precedence" for Handle's
/// `repositories` list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub repositories: Vec<String>,
    pub cachedir: Option<String>,
    pub architecture: Option<String>,
    pub virtualpkgs: Vec<VirtualPkgOverride>,
    pub ignored_pkgs: Vec<String>,
    pub noextract: Vec<String>,
    pub preserved_files: Vec<String>,
    pub syslog: Option<bool>,
}

impl Config {
    /// Parses the contents of a single `.conf` fragment.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        for (lno, key, value) in parse_key_value(s) {
            let key = key?;
            match key {
                "repository" => cfg.repositories.push(value.to_string()),
                "cachedir" => cfg.cachedir = Some(value.to_string()),
                "architecture" => cfg.architecture = Some(value.to_string()),
                "virtualpkg" => {
                    let (name, realpkgver) = value
                        .split_once('=')
                        .ok_or_else(|| ConfigError::MalformedVirtualpkg(value.to_string()))?;
                    cfg.virtualpkgs.push(VirtualPkgOverride {
                        name: name.to_string(),
                        realpkgver: realpkgver.to_string(),
                    });
                }
                "ignorepkg" => cfg.ignored_pkgs.push(value.to_string()),
                "noextract" => cfg.noextract.push(value.to_string()),
                "preserve" => cfg.preserved_files.push(value.to_string()),
                "syslog" => cfg.syslog = Some(value == "true"),
                _ => return Err(ConfigError::Syntax(lno, format!("{key}={value}"))),
            }
        }
        Ok(cfg)
    }

    /// Merges `other` into `self`, as if `other`'s fragment was read after
    /// `self`'s (lower precedence for single-valued fields, appended for
    /// list fields).
    pub fn merge(&mut self, other: Config) {
        self.repositories.extend(other.repositories);
        self.virtualpkgs.extend(other.virtualpkgs);
        self.ignored_pkgs.extend(other.ignored_pkgs);
        self.noextract.extend(other.noextract);
        self.preserved_files.extend(other.preserved_files);
        self.cachedir = self.cachedir.take().or(other.cachedir);
        self.architecture = self.architecture.take().or(other.architecture);
        self.syslog = self.syslog.or(other.syslog);
    }

    /// Loads and merges every `*.conf` fragment under `confdir`, visited in
    /// lexicographic order (earliest file's single-valued fields win, per
    /// the "lexicographically merged" rule).
    pub fn load_dir(confdir: &Path) -> Result<Self, ConfigError> {
        let mut entries: Vec<_> = std::fs::read_dir(confdir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("conf"))
            .collect();
        entries.sort();

        let mut merged = Config::default();
        for path in entries {
            let text = std::fs::read_to_string(&path)?;
            merged.merge(Config::parse(&text)?);
        }
        Ok(merged)
    }
}

fn parse_key_value(s: &str) -> impl Iterator<Item = (usize, Result<&str, ConfigError>, &str)> {
    s.lines().enumerate().filter_map(|(lno, line)| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            None
        } else if let Some((key, value)) = line.split_once('=') {
            Some((lno + 1, Ok(key.trim()), value.trim()))
        } else {
            Some((lno + 1, Err(ConfigError::Syntax(lno + 1, line.to_string())), ""))
        }
    })
}

#[cfg(test)]
#[path = "config.test.rs"]
mod test;
