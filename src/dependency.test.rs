use super::*;
use crate::internal::test_utils::{assert, assert_let, S};

#[test]
fn parses_relational_dependency() {
    let dep: Dependency = "foo>=1.0".parse().unwrap();
    assert!(dep.name() == "foo");
    assert!(dep.matches("foo-1.5_1"));
    assert!(!dep.matches("foo-0.5_1"));
}

#[test]
fn display_round_trips_relational() {
    let dep: Dependency = "foo>=1.0".parse().unwrap();
    assert!(dep.to_string() == "foo>=1.0");
}

#[test]
fn dependencies_from_value_parses_array_of_patterns() {
    let value = Value::Array(vec![
        Value::Str(S!("foo>=1")),
        Value::Str(S!("bar-*")),
    ]);
    let deps = Dependencies::from_value(&value).unwrap();
    assert!(deps.iter().count() == 2);
    assert!(deps.iter().next().unwrap().name() == "foo");
}

#[test]
fn dependencies_from_value_rejects_non_array() {
    assert_let!(Err(DependencyError::NotAnArray) = Dependencies::from_value(&Value::Str(S!("x"))));
}

#[test]
fn dependencies_to_value_round_trips() {
    let deps = Dependencies(vec!["foo>=1".parse().unwrap()]);
    let value = deps.to_value();
    let back = Dependencies::from_value(&value).unwrap();
    assert!(back == deps);
}
