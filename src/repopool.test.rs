use std::collections::BTreeMap;

use super::*;
use crate::internal::test_utils::{assert, S};
use crate::value::Value;

fn pkg_value(pkgname: &str, version: &str, run_depends: &[&str]) -> Value {
    let mut dict = BTreeMap::new();
    dict.insert(S!("pkgname"), Value::Str(pkgname.to_string()));
    dict.insert(S!("version"), Value::Str(version.to_string()));
    dict.insert(S!("architecture"), Value::Str(S!("x86_64")));
    if !run_depends.is_empty() {
        dict.insert(
            S!("run_depends"),
            Value::Array(run_depends.iter().map(|s| Value::Str(s.to_string())).collect()),
        );
    }
    Value::Dict(dict)
}

fn one_pkg_repo(uri: &str, pkgname: &str, version: &str, run_depends: &[&str]) -> Repo {
    let mut dict = BTreeMap::new();
    dict.insert(pkgname.to_string(), pkg_value(pkgname, version, run_depends));
    Repo::load(uri, Value::Dict(dict), None, None).unwrap()
}

#[test]
fn empty_pool_returns_not_supported() {
    let pool = RepoPool::new();
    let pattern: Pattern = "foo".parse().unwrap();
    assert!(pool.get_pkg(&pattern, PoolFlags::none()) == Err(RepoPoolError::NotSupported));
}

#[test]
fn get_pkg_returns_first_pool_order_match_without_bestmatch() {
    let mut pool = RepoPool::new();
    pool.push(one_pkg_repo("repo://a", "foo", "1.0_1", &[]));
    pool.push(one_pkg_repo("repo://b", "foo", "2.0_1", &[]));

    let pattern: Pattern = "foo".parse().unwrap();
    let pkg = pool.get_pkg(&pattern, PoolFlags::none()).unwrap();
    assert!(pkg.repository() == Some("repo://a"));
}

#[test]
fn get_pkg_returns_greatest_version_with_bestmatch() {
    let mut pool = RepoPool::new();
    pool.push(one_pkg_repo("repo://a", "foo", "1.0_1", &[]));
    pool.push(one_pkg_repo("repo://b", "foo", "2.0_1", &[]));

    let pattern: Pattern = "foo".parse().unwrap();
    let pkg = pool.get_pkg(&pattern, PoolFlags::Bestmatch).unwrap();
    assert!(pkg.version().unwrap() == "2.0_1");
}

#[test]
fn get_pkg_revdeps_finds_dependents_across_repos() {
    let mut pool = RepoPool::new();
    pool.push(one_pkg_repo("repo://a", "foo", "1.0_1", &[]));
    pool.push(one_pkg_repo("repo://b", "bar", "1.0_1", &["foo>=1"]));

    let revdeps = pool.get_pkg_revdeps("foo-1.0_1");
    assert!(revdeps.len() == 1);
    assert!(revdeps[0].pkgname().unwrap() == "bar");
}

#[test]
fn repo_by_uri_finds_matching_repo() {
    let mut pool = RepoPool::new();
    pool.push(one_pkg_repo("repo://a", "foo", "1.0_1", &[]));
    pool.push(one_pkg_repo("repo://b", "bar", "1.0_1", &[]));

    let repo = pool.repo_by_uri("repo://b").unwrap();
    assert!(repo.get_pkg_by_name("bar").is_some());
    assert!(pool.repo_by_uri("repo://missing").is_none());
}

#[test]
fn get_pkg_fulldeptree_orders_leaves_first() {
    let mut pool = RepoPool::new();
    pool.push(one_pkg_repo("repo://a", "foo", "1.0_1", &[]));
    pool.push(one_pkg_repo("repo://b", "bar", "1.0_1", &["foo>=1"]));

    let tree = pool.get_pkg_fulldeptree("bar-1.0_1");
    let foo_pos = tree.iter().position(|p| p == "foo-1.0_1").unwrap();
    let bar_pos = tree.iter().position(|p| p == "bar-1.0_1").unwrap();
    assert!(foo_pos < bar_pos);
}
