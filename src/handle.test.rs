use tempfile::tempdir;

use super::*;
use crate::internal::test_utils::assert;

fn init_handle() -> (tempfile::TempDir, Handle) {
    let dir = tempdir().unwrap();
    let rootdir = dir.path().to_path_buf();
    let confdir = rootdir.join("etc/xbps.d");
    let handle = Handle::init(rootdir, confdir, "x86_64".to_string()).unwrap();
    (dir, handle)
}

#[test]
fn init_derives_metadir_and_cachedir_from_rootdir() {
    let (dir, handle) = init_handle();
    assert!(handle.metadir == dir.path().join("var/db/xbps"));
    assert!(handle.cachedir == dir.path().join("var/cache/xbps"));
    assert!(handle.native_arch == "x86_64");
}

#[test]
fn init_merges_conf_fragments() {
    let dir = tempdir().unwrap();
    let rootdir = dir.path().to_path_buf();
    let confdir = rootdir.join("etc/xbps.d");
    std::fs::create_dir_all(&confdir).unwrap();
    std::fs::write(confdir.join("00-repo.conf"), "repository=repo://a\ncachedir=/custom/cache\n").unwrap();
    std::fs::write(confdir.join("10-repo.conf"), "repository=repo://b\n").unwrap();

    let handle = Handle::init(rootdir, confdir, "x86_64".to_string()).unwrap();
    assert!(handle.repositories == vec!["repo://a", "repo://b"]);
    assert!(handle.cachedir == PathBuf::from("/custom/cache"));
}

#[test]
fn pkgdb_is_lazily_opened() {
    let (_dir, mut handle) = init_handle();
    assert!(!handle.pkgdb_opened());
    handle.pkgdb().unwrap();
    assert!(handle.pkgdb_opened());
}

#[test]
fn pool_flags_mirrors_bestmatch() {
    let mut flags = HandleFlags::none();
    assert!(flags.pool_flags() == PoolFlags::none());
    flags |= HandleFlags::Bestmatch;
    assert!(flags.pool_flags() == PoolFlags::Bestmatch);
}

#[test]
fn cancellation_token_is_observed_across_clones() {
    let token = CancellationToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());
    token.cancel();
    assert!(clone.is_cancelled());
}

#[test]
fn sync_repos_pushes_each_configured_repo_into_the_pool() {
    use std::collections::BTreeMap;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use crate::value::Value;

    let (dir, mut handle) = init_handle();

    let repo_dir = tempdir().unwrap();
    let mut pkg = BTreeMap::new();
    pkg.insert("pkgname".to_string(), Value::Str("foo".to_string()));
    pkg.insert("version".to_string(), Value::Str("1.0_1".to_string()));
    pkg.insert("architecture".to_string(), Value::Str("x86_64".to_string()));
    let mut index = BTreeMap::new();
    index.insert("foo".to_string(), Value::Dict(pkg));
    let index_text = Value::Dict(index).externalize().unwrap();
    let idxmeta_text = Value::dict().externalize().unwrap();

    let file = std::fs::File::create(repo_dir.path().join("x86_64-repodata")).unwrap();
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);
    for (name, data) in [("index.plist", &index_text), ("index-meta.plist", &idxmeta_text)] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();

    handle.repositories = vec![format!("file://{}", repo_dir.path().display())];
    handle.sync_repos().unwrap();

    assert!(handle.repopool().repos().len() == 1);
    let _ = dir;
}

#[test]
fn end_releases_the_pkgdb_lock() {
    let (dir, mut handle) = init_handle();
    handle.pkgdb().unwrap();
    handle.end().unwrap();
    assert!(!handle.pkgdb_opened());

    // Lock was released, so a second open under the same metadir succeeds.
    let reopened = Pkgdb::open(&dir.path().join("var/db/xbps"));
    assert!(reopened.is_ok());
}
