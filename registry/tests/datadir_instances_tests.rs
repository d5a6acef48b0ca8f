//! Instance registry tests against the real filesystem
//!
//! These tests verify registration, lookup, listing and removal of instances
//! in a data directory on disk.

mod common;

use common::fixtures::*;
use registry::{DataDir, Instance, InstanceDefect, MemLocker, OsFs, RegistryError};
use rstest::rstest;
use serial_test::serial;
use std::fs;
use std::sync::Arc;

#[test]
fn test_fresh_datadir_lists_no_instances() {
    let env = TestDataDir::new();
    let instances = env.datadir.list_instances().expect("Listing should succeed");
    assert!(instances.is_empty());
}

#[test]
fn test_init_instance_writes_layout() {
    let env = TestDataDir::new();
    let mut instance = instances::sample();
    env.datadir
        .init_instance(&mut instance)
        .expect("Registration should succeed");

    let dir = env.datadir.path().join("nodes").join(instances::ID);
    assert_eq!(instance.path(), dir);
    assert!(dir.join("state.json").is_file());
    assert!(dir.join(".lock").is_file());
    assert_eq!(fs::metadata(dir.join(".lock")).unwrap().len(), 0);
    assert!(env.datadir.has_instance(instances::ID));
}

#[rstest]
#[case("default")]
#[case("v2")]
#[case("with.dots")]
fn test_read_after_init_returns_same_instance(#[case] tag: &str) {
    let env = TestDataDir::new();
    let mut instance = instances::tagged(tag);
    env.datadir.init_instance(&mut instance).unwrap();

    let read_back = env.reopen().instance(&instance.id()).unwrap();
    assert_eq!(read_back, instance);
    assert_eq!(read_back.path(), instance.path());
}

#[test]
fn test_duplicate_registration_fails_and_keeps_original() {
    let env = TestDataDir::new();
    env.datadir.init_instance(&mut instances::sample()).unwrap();

    let mut duplicate = instances::sample();
    duplicate.version = "v9.9.9".to_string();
    let err = env.datadir.init_instance(&mut duplicate).unwrap_err();
    assert!(
        matches!(err, RegistryError::InstanceAlreadyExists { ref instance_id } if instance_id == instances::ID),
        "unexpected error: {err}"
    );

    let stored = env.datadir.instance(instances::ID).unwrap();
    assert_eq!(stored.version, instances::VERSION);
}

#[test]
fn test_invalid_instance_is_rejected_without_side_effects() {
    let env = TestDataDir::new();
    let mut instance = Instance::new(instances::NAME, instances::URL, "", instances::PROFILE, "t");

    match env.datadir.init_instance(&mut instance) {
        Err(RegistryError::InvalidInstance {
            defect: InstanceDefect::EmptyField(field),
            ..
        }) => assert_eq!(field, "version"),
        other => panic!("expected InvalidInstance, got {:?}", other),
    }
    assert!(!env.datadir.path().join("nodes").join("mock-avs-t").exists());
}

#[test]
fn test_list_instances_sorted_by_id() {
    let env = TestDataDir::new();
    for tag in ["zeta", "alpha", "mid"] {
        env.datadir.init_instance(&mut instances::tagged(tag)).unwrap();
    }

    let ids: Vec<String> = env
        .datadir
        .list_instances()
        .unwrap()
        .iter()
        .map(Instance::id)
        .collect();
    assert_eq!(ids, vec!["mock-avs-alpha", "mock-avs-mid", "mock-avs-zeta"]);
}

#[test]
fn test_list_instances_fails_on_broken_entry() {
    let env = TestDataDir::new();
    env.datadir.init_instance(&mut instances::sample()).unwrap();
    fs::create_dir_all(env.datadir.path().join("nodes").join("broken")).unwrap();

    let err = env.datadir.list_instances().unwrap_err();
    assert!(matches!(err, RegistryError::InvalidInstanceDir { .. }));
}

#[test]
fn test_remove_instance() {
    let env = TestDataDir::new();
    let err = env.datadir.remove_instance("unknown-id").unwrap_err();
    assert!(err.is_not_found());

    env.datadir.init_instance(&mut instances::sample()).unwrap();
    env.datadir.remove_instance(instances::ID).unwrap();
    assert!(!env.datadir.has_instance(instances::ID));
    assert!(matches!(
        env.datadir.instance_path(instances::ID),
        Err(RegistryError::InstanceNotFound { .. })
    ));
}

#[test]
fn test_relative_path_is_made_absolute() {
    let datadir = DataDir::new("relative/data", Arc::new(OsFs), Arc::new(MemLocker::new())).unwrap();
    assert!(datadir.path().is_absolute());
    assert!(datadir.path().ends_with("relative/data"));
}

#[test]
#[serial]
fn test_default_datadir_under_xdg_data_home() {
    let temp = tempfile::TempDir::new().unwrap();
    let previous = std::env::var_os("XDG_DATA_HOME");
    std::env::set_var("XDG_DATA_HOME", temp.path());

    let result = DataDir::new_default(Arc::new(OsFs), Arc::new(MemLocker::new()));

    match previous {
        Some(value) => std::env::set_var("XDG_DATA_HOME", value),
        None => std::env::remove_var("XDG_DATA_HOME"),
    }
    let datadir = result.expect("Default data dir should open");
    assert_eq!(datadir.path(), temp.path().join(".node-registry"));
    assert!(datadir.path().is_dir());
}

#[test]
fn test_in_memory_registry_behaves_like_disk() {
    let (fs, datadir) = mem_datadir();
    let mut instance = instances::sample();
    datadir.init_instance(&mut instance).unwrap();

    use registry::Fs;
    assert!(fs
        .exists(&datadir.path().join("nodes").join(instances::ID).join("state.json"))
        .unwrap());
    assert_eq!(datadir.list_instances().unwrap(), vec![instance]);
}

#[rstest]
#[case("..")]
#[case("a/b")]
#[case("")]
fn test_removal_with_unsafe_id_touches_nothing(#[case] id: &str) {
    let env = TestDataDir::new();
    env.datadir.init_instance(&mut instances::sample()).unwrap();

    let err = env.datadir.remove_instance(id).unwrap_err();
    assert!(matches!(err, RegistryError::InvalidId { .. }), "unexpected error: {:?}", err);
    assert!(env.datadir.has_instance(instances::ID));
    assert!(env.datadir.path().join("nodes").join(instances::ID).join("state.json").is_file());
}
