mod common;

use std::fs;

use common::TestEnv;
use layerstore::{IdMap, LayerStoreError, MountOpts, MAX_DEPTH};

#[test]
fn test_parentless_mount_uses_empty_sentinel() {
    let env = TestEnv::new();
    env.driver.create("base", "", None).unwrap();

    let merged = env.driver.get("base", MountOpts::default()).unwrap();
    assert_eq!(merged, env.layer_dir("base").join("merged"));

    let label = env.helper_invocations().pop().unwrap();
    assert!(
        label.contains(&format!("lowerdir={}", env.layer_dir("base").join("empty").display())),
        "label was: {label}"
    );
    assert!(label.contains("upperdir="));
    assert!(label.contains("workdir="));

    env.driver.put("base").unwrap();
}

#[test]
fn test_read_only_mount_stacks_diff_as_topmost_lower() {
    let env = TestEnv::new();
    env.driver.create("a", "", None).unwrap();
    env.driver.create("b", "a", None).unwrap();

    env.driver
        .get(
            "b",
            MountOpts {
                options: vec!["ro".to_string()],
                ..Default::default()
            },
        )
        .unwrap();

    let label = env.helper_invocations().pop().unwrap();
    let expected_prefix = format!(
        "ro,lowerdir={}:",
        env.layer_dir("b").join("diff").display()
    );
    assert!(
        label.starts_with(&expected_prefix),
        "read-only mounts put the layer's own diff first; label was: {label}"
    );
    assert!(!label.contains("upperdir="), "label was: {label}");

    env.driver.put("b").unwrap();
}

#[test]
fn test_mountopt_is_prepended_when_caller_has_no_options() {
    let env = TestEnv::with_extra_options(&["overlay.mountopt=nodev"]);
    env.driver.create("base", "", None).unwrap();

    env.driver.get("base", MountOpts::default()).unwrap();
    let label = env.helper_invocations().pop().unwrap();
    assert!(label.starts_with("nodev,lowerdir="), "label was: {label}");
    env.driver.put("base").unwrap();
}

#[test]
fn test_selinux_label_is_appended_as_context() {
    let env = TestEnv::new();
    env.driver.create("base", "", None).unwrap();

    env.driver
        .get(
            "base",
            MountOpts {
                mount_label: "system_u:object_r:container_file_t:s0:c1,c2".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

    let label = env.helper_invocations().pop().unwrap();
    assert!(
        label.ends_with("context=\"system_u:object_r:container_file_t:s0:c1,c2\""),
        "label was: {label}"
    );
    env.driver.put("base").unwrap();
}

#[test]
fn test_helper_label_carries_id_mappings() {
    let env = TestEnv::new();
    env.driver.create("base", "", None).unwrap();

    env.driver
        .get(
            "base",
            MountOpts {
                uid_maps: vec![IdMap {
                    container_id: 0,
                    host_id: 100000,
                    size: 65536,
                }],
                gid_maps: vec![IdMap {
                    container_id: 0,
                    host_id: 1000,
                    size: 1,
                }],
                ..Default::default()
            },
        )
        .unwrap();

    let label = env.helper_invocations().pop().unwrap();
    assert!(label.contains("uidmapping=0:100000:65536"), "label was: {label}");
    assert!(label.contains("squash_to_gid=1000"), "label was: {label}");
    env.driver.put("base").unwrap();
}

#[test]
fn test_lower_chain_orders_ancestors_upper_first() {
    let env = TestEnv::new();
    env.driver.create("a", "", None).unwrap();
    env.driver.create("b", "a", None).unwrap();
    env.driver.create("c", "b", None).unwrap();

    env.driver.get("c", MountOpts::default()).unwrap();
    let label = env.helper_invocations().pop().unwrap();

    let pos_b = label
        .find(&format!("l/{}", env.link_id("b")))
        .expect("b's link in label");
    let pos_a = label
        .find(&format!("l/{}", env.link_id("a")))
        .expect("a's link in label");
    assert!(pos_b < pos_a, "uppermost ancestor comes first; label: {label}");
    env.driver.put("c").unwrap();
}

#[test]
fn test_rotated_diffs_ride_along_in_order() {
    let env = TestEnv::new();
    env.driver.create("a", "", None).unwrap();
    env.driver.create("b", "a", None).unwrap();

    // A prior remap left rotated uppers behind on both layers.
    fs::create_dir(env.layer_dir("b").join("diff1")).unwrap();
    fs::create_dir(env.layer_dir("a").join("diff1")).unwrap();
    fs::create_dir(env.layer_dir("a").join("diff2")).unwrap();

    env.driver.get("b", MountOpts::default()).unwrap();
    let label = env.helper_invocations().pop().unwrap();

    let own_rotated = label.find("b/diff1").expect("own rotated diff in label");
    let ancestor = label
        .find(&format!("l/{}", env.link_id("a")))
        .expect("ancestor link in label");
    let ancestor_rotated = label
        .find(&format!("l/{}/../diff1", env.link_id("a")))
        .expect("ancestor rotated diff in label");
    let ancestor_rotated2 = label
        .find(&format!("l/{}/../diff2", env.link_id("a")))
        .expect("second ancestor rotation in label");

    assert!(own_rotated < ancestor, "label: {label}");
    assert!(ancestor < ancestor_rotated, "label: {label}");
    assert!(ancestor_rotated < ancestor_rotated2, "label: {label}");
    env.driver.put("b").unwrap();
}

#[test]
fn test_chain_of_exactly_max_depth_mounts() {
    let env = TestEnv::new();
    let mut parent = String::new();
    for i in 0..=MAX_DEPTH {
        let id = format!("layer{i}");
        env.driver.create(&id, &parent, None).unwrap();
        parent = id;
    }

    // The top layer has exactly MAX_DEPTH lower entries.
    let lower = fs::read_to_string(env.layer_dir(&parent).join("lower")).unwrap();
    assert_eq!(lower.split(':').count(), MAX_DEPTH);

    env.driver.get(&parent, MountOpts::default()).unwrap();
    env.driver.put(&parent).unwrap();
}

#[test]
fn test_chain_beyond_max_depth_fails_before_mounting() {
    let env = TestEnv::new();
    let mut parent = String::new();
    for i in 0..=MAX_DEPTH + 1 {
        let id = format!("layer{i}");
        env.driver.create(&id, &parent, None).unwrap();
        parent = id;
    }

    assert!(matches!(
        env.driver.get(&parent, MountOpts::default()),
        Err(LayerStoreError::DepthExceeded)
    ));
    assert!(
        env.helper_invocations().is_empty(),
        "no mount may be attempted past the depth cap"
    );
}

#[test]
fn test_concurrent_gets_share_one_mount() {
    let env = TestEnv::new();
    env.driver.create("shared", "", None).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                env.driver.get("shared", MountOpts::default()).unwrap();
            });
        }
    });

    assert_eq!(
        env.helper_invocations().len(),
        1,
        "exactly one mount for concurrent gets"
    );
    for _ in 0..4 {
        env.driver.put("shared").unwrap();
    }
}

#[test]
fn test_get_missing_layer_fails() {
    let env = TestEnv::new();
    let err = env.driver.get("nope", MountOpts::default()).unwrap_err();
    assert!(err.is_not_found());
}
