use tempfile::tempdir;

use super::*;
use crate::internal::test_utils::assert;

fn open_empty() -> (tempfile::TempDir, Pkgdb) {
    let dir = tempdir().unwrap();
    let pkgdb = Pkgdb::open(dir.path()).unwrap();
    (dir, pkgdb)
}

#[test]
fn open_on_fresh_dir_is_empty() {
    let (_dir, pkgdb) = open_empty();
    assert!(pkgdb.is_empty());
    assert!(pkgdb.half_state_pkgs().is_empty());
}

#[test]
fn second_open_while_locked_returns_busy() {
    let dir = tempdir().unwrap();
    let _held = Pkgdb::open(dir.path()).unwrap();
    let err = Pkgdb::open(dir.path()).unwrap_err();
    assert!(matches!(err, PkgdbError::Busy));
}

#[test]
fn set_pkg_state_enforces_the_diagram() {
    let (_dir, mut pkgdb) = open_empty();
    let mut pkg = Pkg::new("foo", "1.0_1", "x86_64");
    pkg.set_state(PkgState::HalfUnpacked);
    pkgdb.insert(pkg).unwrap();

    pkgdb.set_pkg_state("foo", PkgState::Unpacked).unwrap();
    assert!(pkgdb.get_pkg("foo").unwrap().state() == PkgState::Unpacked);

    let err = pkgdb.set_pkg_state("foo", PkgState::HalfRemoved).unwrap_err();
    assert!(matches!(err, PkgdbError::IllegalTransition { .. }));
}

#[test]
fn flush_is_a_noop_when_nothing_changed() {
    let dir = tempdir().unwrap();
    let mut pkgdb = Pkgdb::open(dir.path()).unwrap();
    pkgdb.flush().unwrap();
    assert!(!dir.path().join("pkgdb-0.38.plist").exists());
}

#[test]
fn flush_then_reopen_round_trips_installed_state() {
    let dir = tempdir().unwrap();
    {
        let mut pkgdb = Pkgdb::open(dir.path()).unwrap();
        let mut pkg = Pkg::new("foo", "1.0_1", "x86_64");
        pkg.set_state(PkgState::Installed);
        pkgdb.insert(pkg).unwrap();
        pkgdb.flush().unwrap();
    }

    let pkgdb = Pkgdb::open(dir.path()).unwrap();
    assert!(pkgdb.get_pkg("foo").unwrap().state() == PkgState::Installed);
}

#[test]
fn foreach_visits_every_pkg_in_sorted_order() {
    let (_dir, mut pkgdb) = open_empty();
    pkgdb.insert(Pkg::new("zeta", "1.0_1", "x86_64")).unwrap();
    pkgdb.insert(Pkg::new("alpha", "1.0_1", "x86_64")).unwrap();

    let mut seen = Vec::new();
    pkgdb
        .foreach::<()>(|pkg| {
            seen.push(pkg.pkgname().unwrap().to_string());
            Ok(())
        })
        .unwrap();
    assert!(seen == vec!["alpha", "zeta"]);
}

#[test]
fn foreach_multi_reports_first_error() {
    let (_dir, mut pkgdb) = open_empty();
    pkgdb.insert(Pkg::new("foo", "1.0_1", "x86_64")).unwrap();
    pkgdb.insert(Pkg::new("bar", "1.0_1", "x86_64")).unwrap();

    let err = pkgdb
        .foreach_multi(|pkg| {
            if pkg.pkgname().unwrap() == "bar" {
                Err("boom")
            } else {
                Ok(())
            }
        })
        .unwrap_err();
    assert!(err == "boom");
}
