use std::os::unix::fs::PermissionsExt;

use tempfile::tempdir;

use super::*;
use crate::internal::test_utils::assert;

fn runner(force_configure: bool) -> PluginRunner {
    PluginRunner {
        rootdir: PathBuf::from("/"),
        native_arch: "x86_64".to_string(),
        target_arch: None,
        force_configure,
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn missing_script_is_a_noop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("foo-INSTALL");
    let result = runner(false).run(&path, "foo", "1.0_1", ScriptAction::Pre);
    assert!(result.is_ok());
}

#[test]
fn successful_script_runs_with_expected_args() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("ran");
    let script = write_script(
        dir.path(),
        "foo-INSTALL",
        &format!(
            "[ \"$1\" = foo ] && [ \"$2\" = 1.0_1 ] && [ \"$3\" = pre ] && [ -n \"$XBPS_ARCH\" ] && touch {}",
            marker.display()
        ),
    );
    let result = runner(false).run(&script, "foo", "1.0_1", ScriptAction::Pre);
    assert!(result.is_ok());
    assert!(marker.exists());
}

#[test]
fn failing_script_is_an_error_without_force_configure() {
    let dir = tempdir().unwrap();
    let script = write_script(dir.path(), "foo-INSTALL", "exit 1");
    let err = runner(false).run(&script, "foo", "1.0_1", ScriptAction::Pre).unwrap_err();
    assert!(matches!(err, PluginError::Exit(_)));
}

#[test]
fn failing_script_is_tolerated_with_force_configure() {
    let dir = tempdir().unwrap();
    let script = write_script(dir.path(), "foo-INSTALL", "exit 1");
    let result = runner(true).run(&script, "foo", "1.0_1", ScriptAction::Pre);
    assert!(result.is_ok());
}

#[test]
fn script_path_uses_action_script_name() {
    let r = runner(false);
    let metadir = Path::new("/var/db/xbps");
    assert!(r.script_path(metadir, "foo", ScriptAction::Pre) == metadir.join("foo-INSTALL"));
    assert!(r.script_path(metadir, "foo", ScriptAction::Remove) == metadir.join("foo-REMOVE"));
}
