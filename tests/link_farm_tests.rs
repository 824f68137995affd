mod common;

use std::fs;

use common::TestEnv;
use layerstore::MountOpts;

#[test]
fn test_lost_symlinks_are_rebuilt_on_mount() {
    let env = TestEnv::new();
    env.driver.create("a", "", None).unwrap();
    env.driver.create("b", "a", None).unwrap();

    // Simulate the farm being wiped by a reboot of volatile storage.
    let farm = env.home.path().join("l");
    for entry in fs::read_dir(&farm).unwrap() {
        fs::remove_file(entry.unwrap().path()).unwrap();
    }
    assert_eq!(fs::read_dir(&farm).unwrap().count(), 0);

    // Mounting b needs a's symlink; the driver rebuilds the whole farm.
    env.driver.get("b", MountOpts::default()).unwrap();
    env.driver.put("b").unwrap();

    for id in ["a", "b"] {
        let link = env.link_id(id);
        let target = fs::read_link(farm.join(&link)).unwrap();
        assert_eq!(target, std::path::PathBuf::from(format!("../{id}/diff")));
    }
}

#[test]
fn test_rebuild_tolerates_intact_links() {
    let env = TestEnv::new();
    env.driver.create("a", "", None).unwrap();
    env.driver.create("b", "a", None).unwrap();

    let farm = env.home.path().join("l");
    let link_a = env.link_id("a");
    let link_b = env.link_id("b");

    // Only a's symlink is lost; b's stays.
    fs::remove_file(farm.join(&link_a)).unwrap();

    env.driver.get("b", MountOpts::default()).unwrap();
    env.driver.put("b").unwrap();

    assert!(farm.join(&link_a).symlink_metadata().is_ok());
    assert!(farm.join(&link_b).symlink_metadata().is_ok());
}

#[test]
fn test_mount_after_rebuild_references_the_same_links() {
    let env = TestEnv::new();
    env.driver.create("a", "", None).unwrap();
    env.driver.create("b", "a", None).unwrap();

    let link_a = env.link_id("a");
    let farm = env.home.path().join("l");
    fs::remove_file(farm.join(&link_a)).unwrap();

    env.driver.get("b", MountOpts::default()).unwrap();
    let label = env.helper_invocations().pop().unwrap();
    assert!(
        label.contains(&format!("l/{link_a}")),
        "the rebuilt farm keeps the short id from the layer's link file; label: {label}"
    );
    env.driver.put("b").unwrap();
}
