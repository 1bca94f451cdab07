use std::collections::BTreeMap;

use tempfile::tempdir;

use super::*;
use crate::internal::test_utils::assert;


#[test]
fn externalize_then_internalize_is_idempotent() {
    let mut dict = BTreeMap::new();
    dict.insert("pkgname".to_string(), Value::Str("foo".to_string()));
    dict.insert("installed_size".to_string(), Value::UInt(1234));
    dict.insert("automatic-install".to_string(), Value::Bool(true));
    dict.insert(
        "run_depends".to_string(),
        Value::Array(vec![Value::Str("bar>=1".to_string())]),
    );
    dict.insert("sig".to_string(), Value::data(vec![0xDE, 0xAD, 0xBE, 0xEF]));
    let original = Value::Dict(dict);

    let text = original.externalize().unwrap();
    let roundtripped = Value::internalize(&text).unwrap();
    assert!(roundtripped == original);

    let text2 = roundtripped.externalize().unwrap();
    assert!(text2 == text);
}

#[test]
fn data_blob_is_not_confused_with_dict() {
    let v = Value::data(vec![1, 2, 3]);
    let text = v.externalize().unwrap();
    let back = Value::internalize(&text).unwrap();
    assert!(back.as_data() == Some(&[1u8, 2, 3][..]));
    assert!(back.as_dict().is_none());
}

#[test]
fn externalize_to_file_is_atomic_and_readable_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.plist");

    let mut dict = BTreeMap::new();
    dict.insert("pkgname".to_string(), Value::Str("foo".to_string()));
    let original = Value::Dict(dict);

    original.externalize_to_file(&path).unwrap();
    let back = Value::internalize_from_file(&path).unwrap().unwrap();
    assert!(back == original);
}

#[test]
fn internalize_from_file_tolerates_absence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.plist");

    let back = Value::internalize_from_file(&path).unwrap();
    assert!(back.is_none());
}
