use tempfile::tempdir;

use super::*;
use crate::internal::test_utils::assert;

#[test]
fn parse_reads_every_recognized_key() {
    let text = "\
# a comment
repository=https://repo.voidlinux.org/current
architecture=x86_64
virtualpkg=cmd:sh=dash-0.5.11_1
ignorepkg=firefox-esr
noextract=./etc/*
preserve=/etc/passwd
syslog=true
";
    let cfg = Config::parse(text).unwrap();
    assert!(cfg.repositories == vec!["https://repo.voidlinux.org/current"]);
    assert!(cfg.architecture.as_deref() == Some("x86_64"));
    assert!(
        cfg.virtualpkgs
            == vec![VirtualPkgOverride {
                name: "cmd:sh".to_string(),
                realpkgver: "dash-0.5.11_1".to_string(),
            }]
    );
    assert!(cfg.ignored_pkgs == vec!["firefox-esr"]);
    assert!(cfg.noextract == vec!["./etc/*"]);
    assert!(cfg.preserved_files == vec!["/etc/passwd"]);
    assert!(cfg.syslog == Some(true));
}

#[test]
fn parse_rejects_lines_without_equals() {
    assert!(Config::parse("not-a-key-value").is_err());
}

#[test]
fn merge_appends_lists_and_keeps_first_scalar() {
    let mut a = Config {
        repositories: vec!["repo-a".to_string()],
        architecture: Some("x86_64".to_string()),
        ..Default::default()
    };
    let b = Config {
        repositories: vec!["repo-b".to_string()],
        architecture: Some("aarch64".to_string()),
        ..Default::default()
    };
    a.merge(b);
    assert!(a.repositories == vec!["repo-a", "repo-b"]);
    assert!(a.architecture.as_deref() == Some("x86_64"));
}

#[test]
fn load_dir_merges_fragments_lexicographically() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("10-repo.conf"), "repository=repo-a\n").unwrap();
    std::fs::write(dir.path().join("20-repo.conf"), "repository=repo-b\n").unwrap();
    std::fs::write(dir.path().join("ignored.txt"), "repository=repo-c\n").unwrap();

    let cfg = Config::load_dir(dir.path()).unwrap();
    assert!(cfg.repositories == vec!["repo-a", "repo-b"]);
}
