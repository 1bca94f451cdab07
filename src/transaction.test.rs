use std::collections::BTreeMap;

use tempfile::tempdir;

use super::*;
use crate::internal::test_utils::{assert, assert_let, S};
use crate::pkg::PkgState;
use crate::repo::Repo;
use crate::value::Value;

fn with_deps(mut pkg: Pkg, key: &str, deps: &[&str]) -> Pkg {
    pkg.0.insert(
        S!(key),
        Value::Array(deps.iter().map(|s| Value::Str(s.to_string())).collect()),
    );
    pkg
}

fn installed_pkg(pkgname: &str, version: &str, automatic: bool) -> Pkg {
    let mut pkg = Pkg::new(pkgname, version, "x86_64");
    pkg.set_state(PkgState::Installed);
    if automatic {
        pkg.0.insert(S!("automatic-install"), Value::Bool(true));
    }
    pkg
}

fn pkgdb_with(pkgs: Vec<Pkg>) -> (tempfile::TempDir, Pkgdb) {
    let dir = tempdir().unwrap();
    let mut db = Pkgdb::open(dir.path()).unwrap();
    for pkg in pkgs {
        db.insert(pkg).unwrap();
    }
    (dir, db)
}

fn pool(pkgs: Vec<Pkg>) -> RepoPool {
    let mut dict = BTreeMap::new();
    for pkg in pkgs {
        dict.insert(pkg.pkgname().unwrap().to_string(), pkg.to_value());
    }
    let mut repopool = RepoPool::new();
    repopool.push(Repo::load("repo://test", Value::Dict(dict), None, None).unwrap());
    repopool
}

fn build<'a>(pkgdb: &'a Pkgdb, repopool: &'a RepoPool, rootdir: &Path) -> TransactionBuilder<'a> {
    TransactionBuilder::new(pkgdb, repopool, &[], PoolFlags::none(), false, false, rootdir)
}

#[test]
fn install_pkg_rejects_already_installed_without_force() {
    let (_dir, pkgdb) = pkgdb_with(vec![installed_pkg("foo", "1.0_1", false)]);
    let repopool = RepoPool::new();
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    let err = builder.install_pkg(&"foo".parse().unwrap(), false).unwrap_err();
    assert!(matches!(err, Error::Exists(_)));
}

#[test]
fn install_pkg_allows_already_installed_with_force() {
    let (_dir, pkgdb) = pkgdb_with(vec![installed_pkg("foo", "1.0_1", false)]);
    let repopool = pool(vec![Pkg::new("foo", "1.0_1", "x86_64")]);
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.install_pkg(&"foo".parse().unwrap(), true).unwrap();
    let plan = builder.prepare().unwrap();
    assert!(plan.packages.len() == 1);
    assert!(plan.packages[0].kind == TransKind::Reinstall);
}

#[test]
fn update_pkg_rejects_when_already_at_best_version() {
    let (_dir, pkgdb) = pkgdb_with(vec![installed_pkg("foo", "2.0_1", false)]);
    let repopool = pool(vec![Pkg::new("foo", "2.0_1", "x86_64")]);
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    let err = builder.update_pkg("foo", false).unwrap_err();
    assert!(matches!(err, Error::Exists(_)));
}

#[test]
fn update_pkg_rejects_unknown_name() {
    let (_dir, pkgdb) = pkgdb_with(vec![]);
    let repopool = RepoPool::new();
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    let err = builder.update_pkg("missing", false).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn remove_pkg_rejects_unknown_name() {
    let (_dir, pkgdb) = pkgdb_with(vec![]);
    let repopool = RepoPool::new();
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    let err = builder.remove_pkg("missing", false).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn prepare_installs_with_one_dependency() {
    let (_dir, pkgdb) = pkgdb_with(vec![]);
    let bar = Pkg::new("bar", "1.0_1", "x86_64");
    let foo = with_deps(Pkg::new("foo", "1.0_1", "x86_64"), "run_depends", &["bar>=0"]);
    let repopool = pool(vec![foo, bar]);
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.install_pkg(&"foo".parse().unwrap(), false).unwrap();
    let plan = builder.prepare().unwrap();

    let names: Vec<&str> = plan.packages.iter().map(|op| op.pkgname.as_str()).collect();
    assert!(names == vec!["bar", "foo"]);
    assert!(plan.packages.iter().all(|op| op.download));
    assert!(plan.packages.iter().find(|op| op.pkgname == "bar").unwrap().automatic);
    assert!(!plan.packages.iter().find(|op| op.pkgname == "foo").unwrap().automatic);
}

#[test]
fn prepare_reports_missing_dependency() {
    let (_dir, pkgdb) = pkgdb_with(vec![]);
    let foo = with_deps(Pkg::new("foo", "1.0_1", "x86_64"), "run_depends", &["baz>=0"]);
    let repopool = pool(vec![foo]);
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.install_pkg(&"foo".parse().unwrap(), false).unwrap();
    let err = builder.prepare().unwrap_err();
    assert_let!(Error::NoDev { missing_deps } = err);
    assert!(missing_deps == vec![S!("baz")]);
}

#[test]
fn prepare_detects_conflicting_packages() {
    let (_dir, pkgdb) = pkgdb_with(vec![]);
    let foo = with_deps(Pkg::new("foo", "1.0_1", "x86_64"), "conflicts", &["bar>=0"]);
    let bar = Pkg::new("bar", "1.0_1", "x86_64");
    let repopool = pool(vec![foo, bar]);
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.install_pkg(&"foo".parse().unwrap(), false).unwrap();
    builder.install_pkg(&"bar".parse().unwrap(), false).unwrap();
    let err = builder.prepare().unwrap_err();
    assert_let!(Error::Again { conflicts } = err);
    assert!(!conflicts.is_empty());
}

#[test]
fn prepare_detects_missing_shared_library() {
    let (_dir, pkgdb) = pkgdb_with(vec![]);
    let foo = with_deps(Pkg::new("foo", "1.0_1", "x86_64"), "shlib-requires", &["libfoo.so.1"]);
    let repopool = pool(vec![foo]);
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.install_pkg(&"foo".parse().unwrap(), false).unwrap();
    let err = builder.prepare().unwrap_err();
    assert_let!(Error::NoExec { missing_shlibs } = err);
    assert!(missing_shlibs == vec![S!("libfoo.so.1")]);
}

#[test]
fn prepare_detects_dependency_cycle() {
    let (_dir, pkgdb) = pkgdb_with(vec![]);
    let foo = with_deps(Pkg::new("foo", "1.0_1", "x86_64"), "run_depends", &["bar>=0"]);
    let bar = with_deps(Pkg::new("bar", "1.0_1", "x86_64"), "run_depends", &["foo>=0"]);
    let repopool = pool(vec![foo, bar]);
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.install_pkg(&"foo".parse().unwrap(), false).unwrap();
    let err = builder.prepare().unwrap_err();
    assert_let!(Error::Transaction(TransactionError::Cycle(mut remaining)) = err);
    remaining.sort();
    assert!(remaining == vec![S!("bar"), S!("foo")]);
}

#[test]
fn prepare_requires_self_update_first() {
    let (_dir, pkgdb) = pkgdb_with(vec![
        installed_pkg("xbps", "1.0_1", false),
        installed_pkg("foo", "1.0_1", false),
    ]);
    let repopool = pool(vec![
        Pkg::new("xbps", "2.0_1", "x86_64"),
        Pkg::new("foo", "2.0_1", "x86_64"),
    ]);
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.update_pkg("foo", false).unwrap();
    let err = builder.prepare().unwrap_err();
    assert!(matches!(err, Error::Busy));
}

#[test]
fn prepare_allows_self_update_when_targeted() {
    let (_dir, pkgdb) = pkgdb_with(vec![installed_pkg("xbps", "1.0_1", false)]);
    let repopool = pool(vec![Pkg::new("xbps", "2.0_1", "x86_64")]);
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.update_pkg("xbps", false).unwrap();
    let plan = builder.prepare().unwrap();
    assert!(plan.packages.len() == 1);
    assert!(plan.packages[0].pkgname == "xbps");
}

#[test]
fn reconfigure_pkg_produces_configure_op_without_download() {
    let (_dir, pkgdb) = pkgdb_with(vec![installed_pkg("foo", "1.0_1", false)]);
    let repopool = RepoPool::new();
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.reconfigure_pkg("foo").unwrap();
    let plan = builder.prepare().unwrap();
    assert!(plan.packages.len() == 1);
    assert!(plan.packages[0].pkgname == "foo");
    assert!(plan.packages[0].kind == TransKind::Configure);
    assert!(!plan.packages[0].download);
}

#[test]
fn reconfigure_pkg_rejects_unknown_name() {
    let (_dir, pkgdb) = pkgdb_with(vec![]);
    let repopool = RepoPool::new();
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    let err = builder.reconfigure_pkg("missing").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn autoremove_pkgs_removes_orphans() {
    let (_dir, pkgdb) = pkgdb_with(vec![installed_pkg("orphan", "1.0_1", true)]);
    let repopool = RepoPool::new();
    let rootdir = tempdir().unwrap();
    let mut builder = build(&pkgdb, &repopool, rootdir.path());

    builder.autoremove_pkgs();
    let plan = builder.prepare().unwrap();
    assert!(plan.packages.len() == 1);
    assert!(plan.packages[0].pkgname == "orphan");
    assert!(plan.packages[0].kind == TransKind::Remove);
}
