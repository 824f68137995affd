use layerstore::{DriverOptions, LayerStoreError};

fn parse(options: &[&str]) -> Result<DriverOptions, LayerStoreError> {
    let raw: Vec<String> = options.iter().map(|s| s.to_string()).collect();
    DriverOptions::parse(&raw)
}

#[test]
fn test_mountopt_and_size() {
    let opts = parse(&["overlay.mountopt=nodev", "overlay.size=20g"]).unwrap();
    assert_eq!(opts.mount_options, "nodev");
    assert_eq!(opts.quota_size, 20 << 30);
}

#[test]
fn test_keys_are_case_insensitive_and_prefixed() {
    let opts = parse(&["Overlay2.MountOpt=noatime"]).unwrap();
    assert_eq!(opts.mount_options, "noatime");

    let opts = parse(&["IGNORE_CHOWN_ERRORS=true"]).unwrap();
    assert!(opts.ignore_chown_errors);
}

#[test]
fn test_override_kernel_check_is_accepted_and_ignored() {
    let opts = parse(&["overlay.override_kernel_check=true"]).unwrap();
    assert_eq!(opts.quota_size, 0);
    assert!(opts.mount_program.is_none());
}

#[test]
fn test_unknown_key_is_an_error() {
    match parse(&["overlay.banana=1"]) {
        Err(LayerStoreError::UnknownOption(key)) => assert_eq!(key, "banana"),
        other => panic!("expected UnknownOption, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_malformed_option_is_an_error() {
    assert!(matches!(
        parse(&["overlay.mountopt"]),
        Err(LayerStoreError::MalformedOption(_))
    ));
}

#[test]
fn test_force_mask_literals_and_octal() {
    assert_eq!(
        parse(&["overlay.force_mask=shared"]).unwrap().force_mask,
        Some(0o755)
    );
    assert_eq!(
        parse(&["overlay.force_mask=private"]).unwrap().force_mask,
        Some(0o700)
    );
    assert_eq!(
        parse(&["overlay.force_mask=644"]).unwrap().force_mask,
        Some(0o644)
    );
    assert!(parse(&["overlay.force_mask=rwxr-x"]).is_err());
}

#[test]
fn test_bool_options() {
    assert!(parse(&["overlay.skip_mount_home=1"]).unwrap().skip_mount_home);
    assert!(!parse(&["overlay.skip_mount_home=f"]).unwrap().skip_mount_home);
    assert!(parse(&["overlay.skip_mount_home=maybe"]).is_err());
}

#[test]
fn test_mount_program_must_exist() {
    assert!(parse(&["overlay.mount_program=/does/not/exist"]).is_err());

    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("helper");
    std::fs::write(&program, "#!/bin/sh\n").unwrap();
    let opts = parse(&[&format!("overlay.mount_program={}", program.display())]).unwrap();
    assert_eq!(opts.mount_program.as_deref(), Some(program.as_path()));
}

#[test]
fn test_image_store_must_be_an_absolute_directory() {
    assert!(parse(&["overlay.imagestore=relative/path"]).is_err());

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, "").unwrap();
    assert!(parse(&[&format!("overlay.imagestore={}", file.display())]).is_err());

    let store_a = tempfile::tempdir().unwrap();
    let store_b = tempfile::tempdir().unwrap();
    let opts = parse(&[&format!(
        "overlay.additionalimagestore={},{}",
        store_a.path().display(),
        store_b.path().display()
    )])
    .unwrap();
    assert_eq!(
        opts.image_stores,
        vec![store_a.path().to_path_buf(), store_b.path().to_path_buf()]
    );
}

#[test]
fn test_empty_image_store_value_is_a_no_op() {
    let opts = parse(&["overlay.imagestore="]).unwrap();
    assert!(opts.image_stores.is_empty());
}
