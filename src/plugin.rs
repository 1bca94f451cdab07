use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::internal::exit_status_error::ExitStatusExt;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("I/O error running script")]
    Io(#[from] std::io::Error),

    #[error("script exited unsuccessfully")]
    Exit(#[from] crate::internal::exit_status_error::ExitStatusError),

    #[error("chroot into '{0}' failed")]
    Chroot(PathBuf, #[source] std::io::Error),
}

/// Which script (`INSTALL` or `REMOVE`) and with what argument, per the
/// design's `{pre,post,remove,purge,show-install-msg,show-remove-msg}` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    Pre,
    Post,
    Remove,
    Purge,
    ShowInstallMsg,
    ShowRemoveMsg,
}

impl ScriptAction {
    fn as_str(self) -> &'static str {
        match self {
            ScriptAction::Pre => "pre",
            ScriptAction::Post => "post",
            ScriptAction::Remove => "remove",
            ScriptAction::Purge => "purge",
            ScriptAction::ShowInstallMsg => "show-install-msg",
            ScriptAction::ShowRemoveMsg => "show-remove-msg",
        }
    }

    /// `INSTALL` carries `pre`/`post`/`show-install-msg`; `REMOVE` carries
    /// `remove`/`purge`/`show-remove-msg`.
    fn script_name(self) -> &'static str {
        match self {
            ScriptAction::Pre | ScriptAction::Post | ScriptAction::ShowInstallMsg => "INSTALL",
            ScriptAction::Remove | ScriptAction::Purge | ScriptAction::ShowRemoveMsg => "REMOVE",
        }
    }
}

/// Runs per-package `INSTALL`/`REMOVE` scripts inside the target rootdir
/// with the environment the design fixes (`PATH`, `XBPS_PREFIX`,
/// `XBPS_ARCH`, `XBPS_TARGET_ARCH`).
pub struct PluginRunner {
    pub rootdir: PathBuf,
    pub native_arch: String,
    pub target_arch: Option<String>,
    /// `FORCE_CONFIGURE`: a non-zero exit is tolerated instead of aborting
    /// the enclosing op.
    pub force_configure: bool,
}

impl PluginRunner {
    /// Runs `<metadir>/<pkgname>-<action.script_name()>` if present, inside
    /// `rootdir` (via chroot when it differs from `/`). Absence of the
    /// script file is not an error.
    pub fn run(
        &self,
        script_path: &Path,
        pkgname: &str,
        version: &str,
        action: ScriptAction,
    ) -> Result<(), PluginError> {
        if !script_path.exists() {
            return Ok(());
        }

        let mut cmd = Command::new(script_path);
        cmd.arg(pkgname).arg(version).arg(action.as_str());
        cmd.env_clear();
        cmd.env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin");
        cmd.env("XBPS_PREFIX", "/usr");
        cmd.env("XBPS_ARCH", &self.native_arch);
        if let Some(target_arch) = &self.target_arch {
            cmd.env("XBPS_TARGET_ARCH", target_arch);
        }

        if self.rootdir != Path::new("/") {
            let rootdir = self.rootdir.clone();
            // Safety: `chroot` and `chdir` are async-signal-safe and run in
            // the forked child before exec; no heap allocation happens
            // between fork and exec beyond what the closure itself performs.
            unsafe {
                cmd.pre_exec(move || {
                    nix::unistd::chroot(&rootdir)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    nix::unistd::chdir("/").map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    Ok(())
                });
            }
        }

        let status = cmd.status()?;
        log::debug!(
            "script {} ({} {}) exited with {status}",
            script_path.display(),
            pkgname,
            action.as_str()
        );
        if self.force_configure {
            return Ok(());
        }
        status.exit_ok().map_err(PluginError::from)
    }

    pub fn script_path(&self, metadir: &Path, pkgname: &str, action: ScriptAction) -> PathBuf {
        metadir.join(format!("{pkgname}-{}", action.script_name()))
    }
}

#[cfg(test)]
#[path = "plugin.test.rs"]
mod test;
