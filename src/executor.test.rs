use std::io::Cursor;

use tempfile::tempdir;

use super::*;
use crate::callback::NoopCallback;
use crate::internal::test_utils::{assert, S};
use crate::pkg::{FileEntry, Files, PkgState};
use crate::repo::Repo;
use crate::value::Value;
use crate::verify::sha256_reader;

fn build_artifact(files_member: &str, entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(files_member.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "files.plist", files_member.as_bytes()).unwrap();

    for (name, content, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }

    builder.into_inner().unwrap()
}

fn one_pkg_repo(uri: &str, pkgname: &str) -> Repo {
    let mut dict = std::collections::BTreeMap::new();
    let mut entry = std::collections::BTreeMap::new();
    entry.insert(S!("pkgname"), Value::Str(pkgname.to_string()));
    entry.insert(S!("version"), Value::Str(S!("1.0_1")));
    entry.insert(S!("architecture"), Value::Str(S!("x86_64")));
    dict.insert(pkgname.to_string(), Value::Dict(entry));
    Repo::load(uri, Value::Dict(dict), None, None).unwrap()
}

#[test]
fn install_extracts_files_hashes_manifest_and_transitions_to_installed() {
    let repo_dir = tempdir().unwrap();
    let rootdir = tempdir().unwrap();
    let cachedir = tempdir().unwrap();
    let metadir = tempdir().unwrap();
    let pkgdb_dir = tempdir().unwrap();

    let manifest = Files {
        files: vec![FileEntry { file: S!("/usr/bin/foo"), sha256: S!("ignored"), size: None, mode: None }],
        ..Default::default()
    }
    .to_value()
    .externalize()
    .unwrap();
    let artifact = build_artifact(&manifest, &[("usr/bin/foo", b"echo hi\n", 0o755)]);
    std::fs::write(repo_dir.path().join("foo-1.0_1.x86_64.xbps"), &artifact).unwrap();

    let mut expected_sha = Cursor::new(artifact.clone());
    let expected_sha = sha256_reader(&mut expected_sha).unwrap();

    let repo_uri = format!("file://{}", repo_dir.path().display());
    let mut pkg = Pkg::new("foo", "1.0_1", "x86_64");
    pkg.set_repository(&repo_uri);
    pkg.0.insert(S!("filename-sha256"), Value::Str(expected_sha));

    let op = TransactionOp {
        pkgname: S!("foo"),
        kind: TransKind::Install,
        pkg,
        automatic: false,
        download: true,
        hold: false,
        replace_files_in_pkg_update: false,
    };
    let plan = TransactionPlan { packages: vec![op] };

    let mut pkgdb = Pkgdb::open(pkgdb_dir.path()).unwrap();
    let mut repopool = RepoPool::new();
    repopool.push(one_pkg_repo(&repo_uri, "foo"));

    let mut executor = Executor::new(
        &mut pkgdb,
        &repopool,
        rootdir.path(),
        cachedir.path(),
        metadir.path(),
        S!("x86_64"),
        None,
        false,
        false,
        vec![],
        vec![],
        false,
        false,
        false,
        CancellationToken::new(),
    );
    executor.set_state_callback(Arc::new(NoopCallback));
    executor.commit(plan).unwrap();

    assert!(pkgdb.get_pkg("foo").unwrap().state() == PkgState::Installed);
    assert!(std::fs::read(rootdir.path().join("usr/bin/foo")).unwrap() == b"echo hi\n");
    let written = pkgdb.get_pkg_files("foo").unwrap();
    assert!(written.files.len() == 1);
    assert!(written.files[0].file == "/usr/bin/foo");
}

#[test]
fn remove_deletes_files_and_drops_pkgdb_entry() {
    let rootdir = tempdir().unwrap();
    let cachedir = tempdir().unwrap();
    let metadir = tempdir().unwrap();
    let pkgdb_dir = tempdir().unwrap();

    std::fs::create_dir_all(rootdir.path().join("usr/bin")).unwrap();
    std::fs::write(rootdir.path().join("usr/bin/foo"), b"bin").unwrap();

    let mut pkgdb = Pkgdb::open(pkgdb_dir.path()).unwrap();
    let mut pkg = Pkg::new("foo", "1.0_1", "x86_64");
    pkg.set_state(PkgState::Installed);
    pkgdb.insert(pkg.clone()).unwrap();
    pkgdb
        .set_pkg_files(
            "foo",
            &Files {
                files: vec![FileEntry { file: S!("/usr/bin/foo"), sha256: S!("x"), size: None, mode: None }],
                ..Default::default()
            },
        )
        .unwrap();

    let op = TransactionOp {
        pkgname: S!("foo"),
        kind: TransKind::Remove,
        pkg,
        automatic: false,
        download: false,
        hold: false,
        replace_files_in_pkg_update: false,
    };
    let plan = TransactionPlan { packages: vec![op] };

    let repopool = RepoPool::new();
    let mut executor = Executor::new(
        &mut pkgdb,
        &repopool,
        rootdir.path(),
        cachedir.path(),
        metadir.path(),
        S!("x86_64"),
        None,
        false,
        false,
        vec![],
        vec![],
        false,
        false,
        false,
        CancellationToken::new(),
    );
    executor.commit(plan).unwrap();

    assert!(pkgdb.get_pkg("foo").is_none());
    assert!(!rootdir.path().join("usr/bin/foo").exists());
}

#[test]
fn reconfigure_runs_post_script_without_changing_files() {
    let rootdir = tempdir().unwrap();
    let cachedir = tempdir().unwrap();
    let metadir = tempdir().unwrap();
    let pkgdb_dir = tempdir().unwrap();

    let mut pkgdb = Pkgdb::open(pkgdb_dir.path()).unwrap();
    let mut pkg = Pkg::new("foo", "1.0_1", "x86_64");
    pkg.set_state(PkgState::Installed);
    pkgdb.insert(pkg.clone()).unwrap();

    let op = TransactionOp {
        pkgname: S!("foo"),
        kind: TransKind::Configure,
        pkg,
        automatic: false,
        download: false,
        hold: false,
        replace_files_in_pkg_update: false,
    };
    let plan = TransactionPlan { packages: vec![op] };

    let repopool = RepoPool::new();
    let mut executor = Executor::new(
        &mut pkgdb,
        &repopool,
        rootdir.path(),
        cachedir.path(),
        metadir.path(),
        S!("x86_64"),
        None,
        false,
        false,
        vec![],
        vec![],
        false,
        false,
        false,
        CancellationToken::new(),
    );
    executor.commit(plan).unwrap();

    assert!(pkgdb.get_pkg("foo").unwrap().state() == PkgState::Installed);
}

#[test]
fn empty_plan_is_a_noop() {
    let rootdir = tempdir().unwrap();
    let cachedir = tempdir().unwrap();
    let metadir = tempdir().unwrap();
    let pkgdb_dir = tempdir().unwrap();

    let mut pkgdb = Pkgdb::open(pkgdb_dir.path()).unwrap();
    let repopool = RepoPool::new();
    let mut executor = Executor::new(
        &mut pkgdb,
        &repopool,
        rootdir.path(),
        cachedir.path(),
        metadir.path(),
        S!("x86_64"),
        None,
        false,
        false,
        vec![],
        vec![],
        false,
        false,
        false,
        CancellationToken::new(),
    );
    executor.commit(TransactionPlan::default()).unwrap();
}

#[test]
fn glob_match_supports_star_and_question_mark() {
    assert!(glob_match("/etc/*.conf", "/etc/foo.conf"));
    assert!(!glob_match("/etc/*.conf", "/etc/foo.txt"));
    assert!(glob_match("/etc/foo?.conf", "/etc/foo1.conf"));
    assert!(!glob_match("/etc/foo?.conf", "/etc/foo12.conf"));
}
