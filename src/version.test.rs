use super::*;
use crate::internal::test_utils::{assert, assert_let};

#[test]
fn cmpver_orders_numeric_components() {
    assert!(cmpver("1.0", "1.1") == Ordering::Less);
    assert!(cmpver("1.10", "1.9") == Ordering::Greater);
    assert!(cmpver("1.0", "1.0") == Ordering::Equal);
}

#[test]
fn cmpver_is_antisymmetric_and_reflexive() {
    let pairs = [("1.0", "2.0"), ("1.0_1", "1.0_2"), ("1.0rc1", "1.0"), ("a", "b")];
    for (a, b) in pairs {
        assert!(cmpver(a, b) == cmpver(b, a).reverse());
        assert!(cmpver(a, a) == Ordering::Equal);
    }
}

#[test]
fn cmpver_orders_prerelease_suffixes() {
    assert!(cmpver("1.0rc1", "1.0") == Ordering::Less);
    assert!(cmpver("1.0", "1.0pl1") == Ordering::Less);
    assert!(cmpver("1.0alpha1", "1.0beta1") == Ordering::Less);
}

#[test]
fn cmpver_compares_rev_last() {
    assert!(cmpver("1.0_1", "1.0_2") == Ordering::Less);
    assert!(cmpver("1.0", "1.0_1") == Ordering::Less);
}

#[test]
fn pkg_name_and_version_split_pkgver() {
    assert!(pkg_name("foo-1.0_1") == "foo");
    assert!(pkg_version("foo-1.0_1") == Some("1.0_1"));
    assert!(pkg_name("lib32-foo-2.3") == "lib32-foo");
}

#[test]
fn pattern_parses_each_syntax() {
    assert_let!(Ok(Pattern::Exact(s)) = "foo-1.0_1".parse::<Pattern>());
    assert!(s == "foo-1.0_1");

    assert_let!(Ok(Pattern::Relational { name, constraint }) = "foo>=1.0".parse::<Pattern>());
    assert!(name == "foo");
    assert!(constraint.op == Op::Ge);
    assert!(constraint.version == "1.0");

    assert_let!(Ok(Pattern::Glob { name, .. }) = "foo-*".parse::<Pattern>());
    assert!(name == "foo");
}

#[test]
fn pattern_matches_expected_pkgvers() {
    let p: Pattern = "foo>=1.0".parse().unwrap();
    assert!(p.matches("foo-1.5_1"));
    assert!(!p.matches("foo-0.9_1"));
    assert!(!p.matches("bar-2.0_1"));

    let p: Pattern = "foo-*".parse().unwrap();
    assert!(p.matches("foo-1.0_1"));
    assert!(!p.matches("bar-1.0_1"));
}

#[test]
fn fnmatch_supports_star_question_and_class() {
    assert!(fnmatch("foo-*", "foo-1.0_1"));
    assert!(fnmatch("f?o", "foo"));
    assert!(fnmatch("[fb]oo", "foo"));
    assert!(fnmatch("[fb]oo", "boo"));
    assert!(!fnmatch("[fb]oo", "zoo"));
    assert!(!fnmatch("foo-*", "bar-1.0_1"));
}

#[test]
fn pattern_match_is_a_total_function_onto_bool() {
    for (pattern, version) in [("foo>=1.0", "1.5"), ("foo==1.0", "1.0"), ("foo!=1.0", "2.0")] {
        let p: Pattern = pattern.parse().unwrap();
        let _: bool = pattern_match_version(&p, version);
    }
}
