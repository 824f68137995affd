#![allow(dead_code)]

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use layerstore::{
    ApplyDiffOpts, Change, ChownByMaps, Driver, IdMappings, InitOptions, LayerMounter,
    NaiveDiffDriver, Result, TarCodec, TarOptions,
};

/// Codec stand-in. Archives are a sorted newline-joined listing of the
/// directory; extraction consumes `name=contents` lines. Enough structure
/// for tests to verify what the driver fed it and where.
pub struct StubCodec;

impl TarCodec for StubCodec {
    fn tar_with_options(&self, dir: &Path, _options: &TarOptions) -> Result<Box<dyn Read + Send>> {
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(Box::new(std::io::Cursor::new(names.join("\n").into_bytes())))
    }

    fn untar_uncompressed(
        &self,
        diff: &mut dyn Read,
        dest: &Path,
        _options: &TarOptions,
    ) -> Result<()> {
        let mut buf = String::new();
        diff.read_to_string(&mut buf)?;
        for line in buf.lines() {
            if let Some((name, contents)) = line.split_once('=') {
                fs::write(dest.join(name), contents)?;
            }
        }
        Ok(())
    }

    fn overlay_changes(&self, _lowers: &[PathBuf], _diff_dir: &Path) -> Result<Vec<Change>> {
        Ok(Vec::new())
    }
}

/// Naive-diff stand-in with recognizable canned results, so tests can tell
/// delegation apart from the native path.
pub struct StubNaive;

pub const STUB_NAIVE_DIFF_SIZE: u64 = 4242;
pub const STUB_NAIVE_DIFF_BYTES: &[u8] = b"naive-diff-stream";

impl NaiveDiffDriver for StubNaive {
    fn diff(
        &self,
        _layers: &dyn LayerMounter,
        _id: &str,
        _mappings: Option<&IdMappings>,
        _parent: &str,
        _parent_mappings: Option<&IdMappings>,
        _mount_label: &str,
    ) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::io::Cursor::new(
            STUB_NAIVE_DIFF_BYTES.to_vec(),
        )))
    }

    fn diff_size(
        &self,
        _layers: &dyn LayerMounter,
        _id: &str,
        _mappings: Option<&IdMappings>,
        _parent: &str,
        _parent_mappings: Option<&IdMappings>,
        _mount_label: &str,
    ) -> Result<u64> {
        Ok(STUB_NAIVE_DIFF_SIZE)
    }

    fn changes(
        &self,
        _layers: &dyn LayerMounter,
        _id: &str,
        _mappings: Option<&IdMappings>,
        _parent: &str,
        _parent_mappings: Option<&IdMappings>,
        _mount_label: &str,
    ) -> Result<Vec<Change>> {
        Ok(Vec::new())
    }

    fn apply_diff(
        &self,
        _layers: &dyn LayerMounter,
        _id: &str,
        _parent: &str,
        _options: ApplyDiffOpts<'_>,
    ) -> Result<u64> {
        Ok(0)
    }
}

pub struct StubChown;

impl ChownByMaps for StubChown {
    fn chown_path_by_maps(
        &self,
        _path: &Path,
        _to_container: Option<&IdMappings>,
        _to_host: Option<&IdMappings>,
    ) -> Result<()> {
        Ok(())
    }
}

/// A driver wired to a fake mount program, so everything up to the mount
/// boundary runs unprivileged. The fake program appends each composed mount
/// label (its `-o` argument) to `helper_log`.
pub struct TestEnv {
    pub home: TempDir,
    pub run_root: TempDir,
    pub helper_log: PathBuf,
    pub driver: Driver,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        TestEnv::with_extra_options(&[])
    }

    pub fn with_extra_options(extra: &[&str]) -> TestEnv {
        let home = tempfile::tempdir().unwrap();
        let run_root = tempfile::tempdir().unwrap();

        let helper_log = run_root.path().join("mount-program.log");
        let program = run_root.path().join("fake-mount-program");
        fs::write(
            &program,
            format!("#!/bin/sh\nprintf '%s\\n' \"$2\" >> {}\n", helper_log.display()),
        )
        .unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

        let mut driver_options = vec![
            format!("overlay.mount_program={}", program.display()),
            "overlay.skip_mount_home=true".to_string(),
            // Writable uppers regardless of the uid the tests run as.
            "overlay.force_mask=shared".to_string(),
        ];
        driver_options.extend(extra.iter().map(|s| s.to_string()));

        let driver = Driver::init(
            home.path(),
            InitOptions {
                run_root: run_root.path().to_path_buf(),
                driver_options,
                uid_maps: Vec::new(),
                gid_maps: Vec::new(),
                codec: Arc::new(StubCodec),
                naive: Arc::new(StubNaive),
                chown: Arc::new(StubChown),
                quota: None,
            },
        )
        .expect("driver init with a mount helper should not need kernel support");

        TestEnv {
            home,
            run_root,
            helper_log,
            driver,
        }
    }

    /// Mount labels the fake helper has been invoked with, oldest first.
    pub fn helper_invocations(&self) -> Vec<String> {
        match fs::read_to_string(&self.helper_log) {
            Ok(content) => content.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn layer_dir(&self, id: &str) -> PathBuf {
        self.home.path().join(id)
    }

    pub fn link_id(&self, id: &str) -> String {
        fs::read_to_string(self.layer_dir(id).join("link"))
            .unwrap()
            .trim_end()
            .to_string()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        TestEnv::new()
    }
}
