#![cfg(test)]

use crate::endpoint::Endpoint;
use crate::lfn::{LogicalName, NameError};

#[test]
fn canonical_form_is_trimmed_and_lowercased() {
    let n = LogicalName::parse("~  MyScope::SubScope::File@Cluster1  ").unwrap();
    assert_eq!(n.get(false), "myscope::subscope::file");
    assert_eq!(n.tail(), "file");
    assert_eq!(n.cluster(), Some("cluster1"));
    assert!(!n.is_foreign());
    assert!(!n.is_external());
    assert!(!n.is_multi());
    assert!(n.is_set());
}

#[test]
fn parse_is_a_fixed_point() {
    for input in [
        "~  MyScope::SubScope::File@Cluster1  ",
        "a :: b :: c",
        "foreign::10.0.0.1:7070::a::b",
        "file::192.168.1.1::c$::users::bob::x.txt",
        "prefix::{a,b,~absolute::name}",
        "",
    ] {
        let once = LogicalName::parse(input).unwrap();
        let twice = LogicalName::parse(once.get(false)).unwrap();
        assert_eq!(once.get(false), twice.get(false), "input {input:?}");
    }
}

#[test]
fn empty_input_maps_to_the_blank_sentinel() {
    let n = LogicalName::parse("").unwrap();
    assert_eq!(n.get(false), ".::_blank_");
    assert_eq!(n.tail(), "_blank_");
    let n = LogicalName::parse("   ").unwrap();
    assert_eq!(n.get(false), ".::_blank_");
}

#[test]
fn rootless_and_leading_separator_forms_get_the_root_scope() {
    assert_eq!(LogicalName::parse("plain").unwrap().get(false), ".::plain");
    assert_eq!(LogicalName::parse("::abc").unwrap().get(false), ".::abc");
}

#[test]
fn scopes_are_trimmed_individually() {
    let n = LogicalName::parse("a :: b :: c").unwrap();
    assert_eq!(n.get(false), "a::b::c");
    assert_eq!(n.tail(), "c");
}

#[test]
fn leading_tilde_runs_are_consumed() {
    assert_eq!(LogicalName::parse("~x::y").unwrap().get(false), "x::y");
    assert_eq!(LogicalName::parse("~ ~x::y").unwrap().get(false), "x::y");
}

#[test]
fn cluster_suffix_rules() {
    // a ':' anywhere after the '@' cancels the cluster
    let n = LogicalName::parse("a@b::c").unwrap();
    assert_eq!(n.get(false), "a@b::c");
    assert_eq!(n.cluster(), None);

    // trailing '@' alone means no cluster
    let n = LogicalName::parse("scope::file@").unwrap();
    assert_eq!(n.get(false), "scope::file");
    assert_eq!(n.cluster(), None);

    // '@' followed by '@' or '^' is an escape kept literally
    let n = LogicalName::parse("a@^b").unwrap();
    assert_eq!(n.get(false), ".::a^b");
    assert_eq!(n.cluster(), None);
    let n = LogicalName::parse("a@@b").unwrap();
    assert_eq!(n.get(false), ".::a@");
    assert_eq!(n.cluster(), Some("b"));
}

#[test]
fn set_cluster_trims_and_lowercases() {
    let mut n = LogicalName::parse("a::b").unwrap();
    n.set_cluster("  Thor400 ");
    assert_eq!(n.cluster(), Some("thor400"));
    n.set_cluster("");
    assert_eq!(n.cluster(), None);
}

#[test]
fn wildcards_are_rejected_outside_external_names() {
    assert!(matches!(LogicalName::parse("scope::*"), Err(NameError::Wildcard(_))));
    assert!(matches!(LogicalName::parse("sco?pe::x"), Err(NameError::Wildcard(_))));
    // external names may carry wildcards
    let n = LogicalName::parse("file::10.0.0.1::dir::*").unwrap();
    assert!(n.is_external());
    assert_eq!(n.tail(), "*");
}

#[test]
fn foreign_prefix_is_normalized_and_offsets_tracked() {
    let n = LogicalName::parse("foreign::10.0.0.1:7070::a::b").unwrap();
    assert_eq!(n.get(false), "foreign::10.0.0.1:7070::a::b");
    assert!(n.is_foreign());
    assert_eq!(n.get(true), "a::b");
    assert_eq!(n.tail(), "b");
    assert_eq!(n.scopes(true), "a");
    assert_eq!(n.scopes(false), "foreign::10.0.0.1:7070::a");
    // the local remainder is itself a valid non-foreign name
    let local = LogicalName::parse(n.get(true)).unwrap();
    assert!(!local.is_foreign());
}

#[test]
fn foreign_without_a_parsable_endpoint_is_a_plain_name() {
    let n = LogicalName::parse("foreign::not a host::x").unwrap();
    assert!(!n.is_foreign());
    assert_eq!(n.get(false), "foreign::not a host::x");
}

#[test]
fn query_names_preserve_case_after_the_marker() {
    let n = LogicalName::parse("FILE::1.2.3.4::>Select THIS Thing").unwrap();
    assert!(n.is_external());
    assert!(n.is_query());
    assert_eq!(n.get(false), "file::1.2.3.4::>Select THIS Thing");
    assert_eq!(n.tail(), ">Select THIS Thing");
}

#[test]
fn from_query_builds_the_external_query_form() {
    let ep: Endpoint = "1.2.3.4:7100".parse().unwrap();
    let n = LogicalName::from_query(&ep, "  Set.ByName  ");
    assert_eq!(n.get(false), "file::1.2.3.4:7100::>Set.ByName");
    assert!(n.is_query());
    assert_eq!(n.tail(), ">Set.ByName");
}

#[test]
fn from_scopes_joins_and_falls_back() {
    let n = LogicalName::from_scopes("scope::sub", "name").unwrap();
    assert_eq!(n.get(false), "scope::sub::name");
    let n = LogicalName::from_scopes("scope::", "name").unwrap();
    assert_eq!(n.get(false), "scope::name");
    // absolute tail ignores the scopes
    let n = LogicalName::from_scopes("scope", "~other::name").unwrap();
    assert_eq!(n.get(false), "other::name");
    let n = LogicalName::from_scopes("", "name").unwrap();
    assert_eq!(n.get(false), ".::name");
}

#[test]
fn set_and_clear_foreign() {
    let ep: Endpoint = "10.0.0.1:7070".parse().unwrap();
    let mut n = LogicalName::parse("a::b").unwrap();
    n.set_foreign(&ep, false).unwrap();
    assert_eq!(n.get(false), "foreign::10.0.0.1:7070::a::b");

    // check_local leaves an already-foreign name alone
    let other: Endpoint = "5.6.7.8".parse().unwrap();
    n.set_foreign(&other, true).unwrap();
    assert_eq!(n.get(false), "foreign::10.0.0.1:7070::a::b");
    // without it the prefix is replaced
    n.set_foreign(&other, false).unwrap();
    assert_eq!(n.get(false), "foreign::5.6.7.8::a::b");

    n.clear_foreign().unwrap();
    assert_eq!(n.get(false), "a::b");

    // external names never go foreign
    let mut x = LogicalName::parse("file::1.2.3.4::dir::f").unwrap();
    x.set_foreign(&ep, false).unwrap();
    assert!(!x.is_foreign());
}

#[test]
fn from_mask_derives_the_logical_name() {
    let n = LogicalName::from_mask("/data/thor/myscope/name._1_of_3", "/data/thor").unwrap();
    assert_eq!(n.get(false), "myscope::name");

    let n =
        LogicalName::from_mask("C:\\data\\Scope\\Name._12_of_400", "D:\\data").unwrap();
    assert_eq!(n.get(false), "scope::name");

    // base directory mismatch
    assert!(LogicalName::from_mask("/other/scope/name._1_of_3", "/data").is_none());
    // no part suffix means no tail was found
    assert!(LogicalName::from_mask("/data/scope/plainfile", "/data").is_none());
    assert!(LogicalName::from_mask("/data/scope/name._1_of_", "/data").is_none());
}

#[test]
fn default_is_unset() {
    let n = LogicalName::default();
    assert!(!n.is_set());
    assert_eq!(n.get(false), "");
}
