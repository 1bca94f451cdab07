//! End-to-end coverage exercising `Pkgdb`, `RepoPool`, `TransactionBuilder`
//! and `Executor` together, the way an embedder actually drives them.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use assert2::assert;
use tempfile::TempDir;

use xbpskit::error::Error;
use xbpskit::handle::CancellationToken;
use xbpskit::pkg::{Pkg, PkgState};
use xbpskit::pkgdb::Pkgdb;
use xbpskit::repo::Repo;
use xbpskit::repopool::{PoolFlags, RepoPool};
use xbpskit::transaction::{TransKind, TransactionBuilder};
use xbpskit::value::Value;
use xbpskit::verify::sha256_reader;
use xbpskit::version::Pattern;

struct Fixture {
    repo_dir: TempDir,
    rootdir: TempDir,
    cachedir: TempDir,
    metadir: TempDir,
    pkgdb_dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Fixture {
            repo_dir: TempDir::new().unwrap(),
            rootdir: TempDir::new().unwrap(),
            cachedir: TempDir::new().unwrap(),
            metadir: TempDir::new().unwrap(),
            pkgdb_dir: TempDir::new().unwrap(),
        }
    }

    fn repo_uri(&self) -> String {
        format!("file://{}", self.repo_dir.path().display())
    }
}

/// Writes a minimal artifact (an empty `files.plist`, no payload entries) for
/// `pkgname-version.arch.xbps` into `dir` and returns its sha256.
fn write_empty_artifact(dir: &Path, pkgname: &str, version: &str, arch: &str) -> String {
    let manifest = xbpskit::pkg::Files::default().to_value().externalize().unwrap();
    let artifact = build_artifact(&manifest, &[]);
    std::fs::write(dir.join(format!("{pkgname}-{version}.{arch}.xbps")), &artifact).unwrap();
    let mut cursor = std::io::Cursor::new(artifact);
    sha256_reader(&mut cursor).unwrap()
}

/// Writes an artifact carrying one regular file, for the scenarios that care
/// about actual payload contents (file-conflict detection, crash resume).
fn write_artifact_with_file(
    dir: &Path,
    pkgname: &str,
    version: &str,
    arch: &str,
    path_in_pkg: &str,
    content: &[u8],
) -> String {
    let manifest = xbpskit::pkg::Files {
        files: vec![xbpskit::pkg::FileEntry {
            file: format!("/{path_in_pkg}"),
            sha256: "ignored".to_string(),
            size: None,
            mode: None,
        }],
        ..Default::default()
    }
    .to_value()
    .externalize()
    .unwrap();
    let artifact = build_artifact(&manifest, &[(path_in_pkg, content, 0o644)]);
    std::fs::write(dir.join(format!("{pkgname}-{version}.{arch}.xbps")), &artifact).unwrap();
    let mut cursor = std::io::Cursor::new(artifact);
    sha256_reader(&mut cursor).unwrap()
}

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

fn repo_entry(
    pkgname: &str,
    version: &str,
    arch: &str,
    run_depends: &[&str],
    replaces: &[&str],
    filename_sha256: &str,
) -> Value {
    repo_entry_with_files(pkgname, version, arch, run_depends, replaces, &[], filename_sha256)
}

/// Like [`repo_entry`], but also carries an index-level `files` list, for the
/// step-4c incoming-vs-incoming conflict scan (the full manifest is only
/// known for certain once the artifact is downloaded and extracted, but the
/// repo index's own pkg entry is still consulted ahead of that).
#[allow(clippy::too_many_arguments)]
fn repo_entry_with_files(
    pkgname: &str,
    version: &str,
    arch: &str,
    run_depends: &[&str],
    replaces: &[&str],
    owned_files: &[&str],
    filename_sha256: &str,
) -> Value {
    let mut dict = BTreeMap::new();
    dict.insert("pkgname".to_string(), Value::Str(pkgname.to_string()));
    dict.insert("version".to_string(), Value::Str(version.to_string()));
    dict.insert("architecture".to_string(), Value::Str(arch.to_string()));
    dict.insert("filename-sha256".to_string(), Value::Str(filename_sha256.to_string()));
    if !run_depends.is_empty() {
        dict.insert(
            "run_depends".to_string(),
            Value::Array(run_depends.iter().map(|s| Value::Str(s.to_string())).collect()),
        );
    }
    if !replaces.is_empty() {
        dict.insert(
            "replaces".to_string(),
            Value::Array(replaces.iter().map(|s| Value::Str(s.to_string())).collect()),
        );
    }
    if !owned_files.is_empty() {
        let files = xbpskit::pkg::Files {
            files: owned_files
                .iter()
                .map(|f| xbpskit::pkg::FileEntry {
                    file: f.to_string(),
                    sha256: "ignored".to_string(),
                    size: None,
                    mode: None,
                })
                .collect(),
            ..Default::default()
        };
        if let Some(files_value) = files.to_value().as_dict().and_then(|d| d.get("files")).cloned() {
            dict.insert("files".to_string(), files_value);
        }
    }
    Value::Dict(dict)
}

fn repo_from(uri: &str, entries: Vec<(&str, Value)>) -> Repo {
    let mut dict = BTreeMap::new();
    for (name, value) in entries {
        dict.insert(name.to_string(), value);
    }
    Repo::load(uri, Value::Dict(dict), None, None).unwrap()
}

fn installed_pkg(pkgname: &str, version: &str, arch: &str, automatic: bool, run_depends: &[&str]) -> Pkg {
    let mut pkg = Pkg::new(pkgname, version, arch);
    pkg.set_state(PkgState::Installed);
    pkg.set_automatic_install(automatic);
    if !run_depends.is_empty() {
        pkg.0.insert(
            "run_depends".to_string(),
            Value::Array(run_depends.iter().map(|s| Value::Str(s.to_string())).collect()),
        );
    }
    pkg
}

fn make_executor<'a>(
    pkgdb: &'a mut Pkgdb,
    repopool: &'a RepoPool,
    fixture: &Fixture,
) -> xbpskit::executor::Executor<'a> {
    xbpskit::executor::Executor::new(
        pkgdb,
        repopool,
        fixture.rootdir.path(),
        fixture.cachedir.path(),
        fixture.metadir.path(),
        "x86_64".to_string(),
        None,
        false,
        false,
        vec![],
        vec![],
        false,
        false,
        false,
        CancellationToken::new(),
    )
}

/// Scenario 1: installing a pkg that needs one absent dependency pulls the
/// dependency in automatically, ahead of the requested pkg, and only the
/// explicitly requested one is marked non-automatic.
#[test]
fn install_with_one_dep_pulls_in_the_dependency() {
    let fixture = Fixture::new();
    let uri = fixture.repo_uri();

    let foo_sha = write_empty_artifact(fixture.repo_dir.path(), "foo", "1.0_1", "x86_64");
    let bar_sha = write_empty_artifact(fixture.repo_dir.path(), "bar", "1.0_1", "x86_64");
    let repo = repo_from(
        &uri,
        vec![
            ("foo", repo_entry("foo", "1.0_1", "x86_64", &[], &[], &foo_sha)),
            ("bar", repo_entry("bar", "1.0_1", "x86_64", &["foo>=1"], &[], &bar_sha)),
        ],
    );

    let mut pkgdb = Pkgdb::open(fixture.pkgdb_dir.path()).unwrap();
    let mut repopool = RepoPool::new();
    repopool.push(repo);

    let plan = {
        let mut builder =
            TransactionBuilder::new(&pkgdb, &repopool, &[], PoolFlags::none(), false, false, fixture.rootdir.path());
        builder.install_pkg(&Pattern::from_str("bar").unwrap(), false).unwrap();
        builder.prepare().unwrap()
    };

    assert!(plan.packages.len() == 2);
    assert!(plan.packages[0].pkgname == "foo");
    assert!(plan.packages[1].pkgname == "bar");

    let mut executor = make_executor(&mut pkgdb, &repopool, &fixture);
    executor.commit(plan).unwrap();

    assert!(pkgdb.get_pkg("foo").unwrap().state() == PkgState::Installed);
    assert!(pkgdb.get_pkg("bar").unwrap().state() == PkgState::Installed);
    assert!(pkgdb.get_pkg("foo").unwrap().automatic_install());
    assert!(!pkgdb.get_pkg("bar").unwrap().automatic_install());
}

/// Scenario 2: a pending self-update blocks every other update until it's
/// addressed, per the `Busy` gate ahead of the closure step.
#[test]
fn update_is_gated_by_a_pending_self_update() {
    let fixture = Fixture::new();
    let uri = fixture.repo_uri();

    let xbps_sha = write_empty_artifact(fixture.repo_dir.path(), "xbps", "2.0_1", "x86_64");
    let qux_sha = write_empty_artifact(fixture.repo_dir.path(), "qux", "1.1_1", "x86_64");
    let repo = repo_from(
        &uri,
        vec![
            ("xbps", repo_entry("xbps", "2.0_1", "x86_64", &[], &[], &xbps_sha)),
            ("qux", repo_entry("qux", "1.1_1", "x86_64", &[], &[], &qux_sha)),
        ],
    );

    let mut pkgdb = Pkgdb::open(fixture.pkgdb_dir.path()).unwrap();
    pkgdb.insert(installed_pkg("xbps", "1.0_1", "x86_64", false, &[])).unwrap();
    pkgdb.insert(installed_pkg("qux", "1.0_1", "x86_64", false, &[])).unwrap();
    let mut repopool = RepoPool::new();
    repopool.push(repo);

    let err = {
        let mut builder =
            TransactionBuilder::new(&pkgdb, &repopool, &[], PoolFlags::none(), false, false, fixture.rootdir.path());
        builder.update_pkg("qux", false).unwrap();
        builder.prepare().unwrap_err()
    };
    assert!(matches!(err, Error::Busy));

    let plan = {
        let mut builder =
            TransactionBuilder::new(&pkgdb, &repopool, &[], PoolFlags::none(), false, false, fixture.rootdir.path());
        builder.update_pkg("xbps", false).unwrap();
        builder.prepare().unwrap()
    };

    let mut executor = make_executor(&mut pkgdb, &repopool, &fixture);
    executor.commit(plan).unwrap();

    assert!(pkgdb.get_pkg("xbps").unwrap().version().unwrap() == "2.0_1");
    assert!(pkgdb.get_pkg("xbps").unwrap().state() == PkgState::Installed);
}

/// Scenario 3: a `replaces` match against an installed pkg that's also
/// independently queued for update becomes that pkg's update op, flagged to
/// let the incoming artifact overwrite its files, rather than a separate
/// remove.
#[test]
fn replaces_folds_into_the_replaced_pkgs_update_op() {
    let fixture = Fixture::new();
    let uri = fixture.repo_uri();

    let b_sha = write_empty_artifact(fixture.repo_dir.path(), "b", "2.0_1", "x86_64");
    let a_sha = write_empty_artifact(fixture.repo_dir.path(), "a", "1.1_1", "x86_64");
    let repo = repo_from(
        &uri,
        vec![
            ("b", repo_entry("b", "2.0_1", "x86_64", &[], &["a*"], &b_sha)),
            ("a", repo_entry("a", "1.1_1", "x86_64", &[], &[], &a_sha)),
        ],
    );

    let mut pkgdb = Pkgdb::open(fixture.pkgdb_dir.path()).unwrap();
    pkgdb.insert(installed_pkg("a", "1.0_1", "x86_64", false, &[])).unwrap();
    let mut repopool = RepoPool::new();
    repopool.push(repo);

    let plan = {
        let mut builder =
            TransactionBuilder::new(&pkgdb, &repopool, &[], PoolFlags::none(), false, false, fixture.rootdir.path());
        builder.install_pkg(&Pattern::from_str("b").unwrap(), false).unwrap();
        builder.update_pkg("a", false).unwrap();
        builder.prepare().unwrap()
    };

    assert!(plan.packages.iter().filter(|op| op.kind == TransKind::Remove).count() == 0);
    let a_op = plan.packages.iter().find(|op| op.pkgname == "a").unwrap();
    assert!(a_op.kind == TransKind::Update);
    assert!(a_op.replace_files_in_pkg_update);
}

/// Scenario 4: removing a leaf recursively also drops the automatic
/// dependency that's only orphaned once the leaf is gone; without
/// `recursive` the dependency survives as an orphan until a later
/// `autoremove_pkgs` pass.
#[test]
fn recursive_remove_cascades_to_the_now_orphaned_dependency() {
    let fixture = Fixture::new();

    let mut pkgdb = Pkgdb::open(fixture.pkgdb_dir.path()).unwrap();
    pkgdb.insert(installed_pkg("leaf", "1.0_1", "x86_64", false, &["lib1>=0"])).unwrap();
    let mut lib1 = installed_pkg("lib1", "1.0_1", "x86_64", true, &[]);
    lib1.add_requiredby("leaf-1.0_1");
    pkgdb.insert(lib1).unwrap();
    let repopool = RepoPool::new();

    let plan = {
        let mut builder =
            TransactionBuilder::new(&pkgdb, &repopool, &[], PoolFlags::none(), false, false, fixture.rootdir.path());
        builder.remove_pkg("leaf", true).unwrap();
        builder.prepare().unwrap()
    };
    assert!(plan.packages.len() == 2);
    assert!(plan.packages.iter().all(|op| op.kind == TransKind::Remove));

    let mut executor = make_executor(&mut pkgdb, &repopool, &fixture);
    executor.commit(plan).unwrap();

    assert!(pkgdb.get_pkg("leaf").is_none());
    assert!(pkgdb.get_pkg("lib1").is_none());
}

#[test]
fn non_recursive_remove_leaves_an_orphan_for_a_later_autoremove() {
    let fixture = Fixture::new();

    let mut pkgdb = Pkgdb::open(fixture.pkgdb_dir.path()).unwrap();
    pkgdb.insert(installed_pkg("leaf", "1.0_1", "x86_64", false, &["lib1>=0"])).unwrap();
    let mut lib1 = installed_pkg("lib1", "1.0_1", "x86_64", true, &[]);
    lib1.add_requiredby("leaf-1.0_1");
    pkgdb.insert(lib1).unwrap();
    let repopool = RepoPool::new();

    let plan = {
        let mut builder =
            TransactionBuilder::new(&pkgdb, &repopool, &[], PoolFlags::none(), false, false, fixture.rootdir.path());
        builder.remove_pkg("leaf", false).unwrap();
        builder.prepare().unwrap()
    };
    assert!(plan.packages.len() == 1);

    {
        let mut executor = make_executor(&mut pkgdb, &repopool, &fixture);
        executor.commit(plan).unwrap();
    }

    assert!(pkgdb.get_pkg("leaf").is_none());
    assert!(pkgdb.get_pkg("lib1").is_some());

    let plan = {
        let mut builder =
            TransactionBuilder::new(&pkgdb, &repopool, &[], PoolFlags::none(), false, false, fixture.rootdir.path());
        builder.autoremove_pkgs();
        builder.prepare().unwrap()
    };
    assert!(plan.packages.len() == 1);
    assert!(plan.packages[0].pkgname == "lib1");

    let mut executor = make_executor(&mut pkgdb, &repopool, &fixture);
    executor.commit(plan).unwrap();
    assert!(pkgdb.get_pkg("lib1").is_none());
}

/// Scenario 5: two incoming pkgs that both claim the same path are rejected
/// with `Again`, before anything is written to pkgdb.
#[test]
fn conflicting_incoming_files_are_rejected() {
    let fixture = Fixture::new();
    let uri = fixture.repo_uri();

    let p1_sha =
        write_artifact_with_file(fixture.repo_dir.path(), "p1", "1.0_1", "x86_64", "usr/bin/hello", b"one");
    let p2_sha =
        write_artifact_with_file(fixture.repo_dir.path(), "p2", "1.0_1", "x86_64", "usr/bin/hello", b"two");
    let repo = repo_from(
        &uri,
        vec![
            (
                "p1",
                repo_entry_with_files("p1", "1.0_1", "x86_64", &[], &[], &["/usr/bin/hello"], &p1_sha),
            ),
            (
                "p2",
                repo_entry_with_files("p2", "1.0_1", "x86_64", &[], &[], &["/usr/bin/hello"], &p2_sha),
            ),
        ],
    );

    let pkgdb = Pkgdb::open(fixture.pkgdb_dir.path()).unwrap();
    let mut repopool = RepoPool::new();
    repopool.push(repo);

    let err = {
        let mut builder =
            TransactionBuilder::new(&pkgdb, &repopool, &[], PoolFlags::none(), false, false, fixture.rootdir.path());
        builder.install_pkg(&Pattern::from_str("p1").unwrap(), false).unwrap();
        builder.install_pkg(&Pattern::from_str("p2").unwrap(), false).unwrap();
        builder.prepare().unwrap_err()
    };
    let Error::Again { conflicts } = err else {
        panic!("expected Error::Again, got {err:?}");
    };
    assert!(!conflicts.is_empty());
    assert!(pkgdb.is_empty());
}

/// Scenario 6: a pkg killed between "files extracted" and "state=UNPACKED"
/// resumes as `HalfUnpacked` on the next open, and the next `commit` (even
/// with an empty plan) re-verifies its manifest and finishes the transition.
#[test]
fn resume_after_crash_finishes_a_half_unpacked_pkg() {
    let fixture = Fixture::new();

    std::fs::create_dir_all(fixture.rootdir.path().join("usr/bin")).unwrap();
    std::fs::write(fixture.rootdir.path().join("usr/bin/foo"), b"payload").unwrap();
    let sha256 = {
        let mut cursor = std::io::Cursor::new(b"payload".to_vec());
        sha256_reader(&mut cursor).unwrap()
    };

    {
        let mut pkgdb = Pkgdb::open(fixture.pkgdb_dir.path()).unwrap();
        let mut pkg = Pkg::new("foo", "1.0_1", "x86_64");
        pkg.set_state(PkgState::HalfUnpacked);
        pkgdb.insert(pkg).unwrap();
        pkgdb
            .set_pkg_files(
                "foo",
                &xbpskit::pkg::Files {
                    files: vec![xbpskit::pkg::FileEntry {
                        file: "/usr/bin/foo".to_string(),
                        sha256,
                        size: None,
                        mode: None,
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        pkgdb.flush().unwrap();
    }

    let mut pkgdb = Pkgdb::open(fixture.pkgdb_dir.path()).unwrap();
    assert!(pkgdb.get_pkg("foo").unwrap().state() == PkgState::HalfUnpacked);
    assert!(pkgdb.half_state_pkgs().len() == 1);

    let repopool = RepoPool::new();
    let mut executor = make_executor(&mut pkgdb, &repopool, &fixture);
    executor.commit(xbpskit::transaction::TransactionPlan::default()).unwrap();

    assert!(pkgdb.get_pkg("foo").unwrap().state() == PkgState::Installed);
}
