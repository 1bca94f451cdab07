use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::tempdir;

use super::*;
use crate::internal::test_utils::assert;

fn write_gzip_tar(path: &Path, members: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

#[test]
fn fetch_plist_finds_named_member() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pkg.xbps");
    write_gzip_tar(
        &path,
        &[
            ("./props.plist", br#"{"pkgname":"foo"}"#),
            ("./files.plist", br#"{"files":[]}"#),
        ],
    );

    let value = Archive::fetch_plist(&path, "/props.plist").unwrap();
    assert!(value.get("pkgname").and_then(Value::as_str) == Some("foo"));
}

#[test]
fn fetch_plist_errors_when_member_missing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pkg.xbps");
    write_gzip_tar(&path, &[("./props.plist", br#"{}"#)]);

    let err = Archive::fetch_plist(&path, "/files.plist").unwrap_err();
    assert!(matches!(err, ArchiveError::NotFound(_)));
}

#[test]
fn iter_visits_every_entry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pkg.xbps");
    write_gzip_tar(
        &path,
        &[
            ("./props.plist", br#"{}"#),
            ("./usr/bin/hello", b"#!/bin/sh\n"),
        ],
    );

    let mut count = 0;
    let mut names = Vec::new();
    Archive::iter(&path)
        .unwrap()
        .for_each(|meta, reader| {
            count += 1;
            names.push(meta.path);
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(())
        })
        .unwrap();

    assert!(count == 2);
    assert!(names.iter().any(|n| n.ends_with("props.plist")));
}
