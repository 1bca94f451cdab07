use tempfile::tempdir;

use super::*;
use crate::internal::test_utils::assert;

#[test]
fn file_fetcher_hardlinks_into_dest_dir() {
    let src_dir = tempdir().unwrap();
    let dest_dir = tempdir().unwrap();

    let src_path = src_dir.path().join("foo-1.0_1.x86_64.xbps");
    std::fs::write(&src_path, b"package bytes").unwrap();

    let url = Url::from_file_path(&src_path).unwrap();
    let outcome = FileFetcher
        .fetch(&url, dest_dir.path(), FetchFlags::none(), None)
        .unwrap();

    assert!(outcome == FetchOutcome::Fetched);
    let dest_path = dest_dir.path().join("foo-1.0_1.x86_64.xbps");
    assert!(std::fs::read(&dest_path).unwrap() == b"package bytes");
}

#[test]
fn file_fetcher_skips_when_same_size_already_present() {
    let src_dir = tempdir().unwrap();
    let dest_dir = tempdir().unwrap();

    let src_path = src_dir.path().join("foo.xbps");
    std::fs::write(&src_path, b"1234").unwrap();
    std::fs::write(dest_dir.path().join("foo.xbps"), b"1234").unwrap();

    let url = Url::from_file_path(&src_path).unwrap();
    let outcome = FileFetcher
        .fetch(&url, dest_dir.path(), FetchFlags::none(), None)
        .unwrap();

    assert!(outcome == FetchOutcome::NotNeeded);
}

#[test]
fn ftp_fetcher_reports_not_implemented() {
    let dest_dir = tempdir().unwrap();
    let url = Url::parse("ftp://example.invalid/pkg.xbps").unwrap();
    let err = FtpFetcher
        .fetch(&url, dest_dir.path(), FetchFlags::none(), None)
        .unwrap_err();
    assert!(matches!(err, FetchError::FtpNotImplemented));
}

#[test]
fn fetcher_for_dispatches_by_scheme() {
    assert!(fetcher_for(&Url::parse("file:///tmp/x").unwrap()).is_ok());
    assert!(fetcher_for(&Url::parse("http://example.invalid/x").unwrap()).is_ok());
    assert!(fetcher_for(&Url::parse("ftp://example.invalid/x").unwrap()).is_ok());
    assert!(fetcher_for(&Url::parse("gopher://example.invalid/x").unwrap()).is_err());
}
