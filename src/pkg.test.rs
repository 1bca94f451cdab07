use super::*;
use crate::internal::test_utils::{assert, S};

#[test]
fn pkgver_matches_universal_invariant() {
    let pkg = Pkg::new("foo", "1.0_1", "x86_64");
    assert!(pkg.pkgver().unwrap() == "foo-1.0_1");
}

#[test]
fn state_defaults_to_not_installed() {
    let pkg = Pkg::new("foo", "1.0_1", "x86_64");
    assert!(pkg.state() == PkgState::NotInstalled);
}

#[test]
fn state_transitions_follow_diagram() {
    use PkgState::*;
    assert!(NotInstalled.can_transition_to(HalfUnpacked));
    assert!(HalfUnpacked.can_transition_to(Unpacked));
    assert!(Unpacked.can_transition_to(Installed));
    assert!(Installed.can_transition_to(HalfRemoved));
    assert!(HalfRemoved.can_transition_to(NotInstalled));
    assert!(!NotInstalled.can_transition_to(Installed));
    assert!(!Installed.can_transition_to(NotInstalled));
}

#[test]
fn requiredby_is_deduplicated() {
    let mut pkg = Pkg::new("foo", "1.0_1", "x86_64");
    pkg.add_requiredby("bar-1.0_1");
    pkg.add_requiredby("bar-1.0_1");
    assert!(pkg.requiredby() == vec!["bar-1.0_1"]);

    pkg.remove_requiredby("bar-1.0_1");
    assert!(pkg.requiredby().is_empty());
}

#[test]
fn run_depends_defaults_to_empty_when_absent() {
    let pkg = Pkg::new("foo", "1.0_1", "x86_64");
    assert!(pkg.run_depends().unwrap().is_empty());
}

#[test]
fn run_depends_parses_pattern_list() {
    let mut pkg = Pkg::new("bar", "1.0_1", "x86_64");
    pkg.0.insert(
        S!("run_depends"),
        Value::Array(vec![Value::Str(S!("foo>=1"))]),
    );
    let deps = pkg.run_depends().unwrap();
    assert!(deps.iter().next().unwrap().name() == "foo");
}

#[test]
fn files_round_trips_through_value() {
    let files = Files {
        files: vec![FileEntry {
            file: S!("/usr/bin/hello"),
            sha256: S!("a".repeat(64)),
            size: Some(42),
            mode: Some(0o755),
        }],
        links: vec![LinkEntry {
            file: S!("/usr/bin/hi"),
            target: S!("hello"),
            sha256: None,
        }],
        dirs: vec![DirEntry {
            file: S!("/usr/bin"),
            mode: Some(0o755),
        }],
        conf_files: vec![ConfFileEntry {
            file: S!("/etc/hello.conf"),
            sha256: S!("b".repeat(64)),
        }],
    };

    let value = files.to_value();
    let back = Files::from_value(&value).unwrap();
    assert!(back == files);
}

#[test]
fn owned_paths_excludes_directories() {
    let files = Files {
        files: vec![FileEntry {
            file: S!("/usr/bin/hello"),
            sha256: S!("a".repeat(64)),
            size: None,
            mode: None,
        }],
        dirs: vec![DirEntry {
            file: S!("/usr/bin"),
            mode: None,
        }],
        ..Default::default()
    };

    let owned: Vec<&str> = files.owned_paths().collect();
    assert!(owned == vec!["/usr/bin/hello"]);
}
