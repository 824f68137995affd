//! Driver and per-operation option types.
//!
//! Driver options arrive from the store as raw `key=value` strings; they are
//! parsed once at init into a typed [`DriverOptions`]. Keys are matched
//! case-insensitively and may carry an `overlay.` or `overlay2.` prefix.
//! Unknown keys are errors; the legacy `override_kernel_check` key is
//! accepted and ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{LayerStoreError, Result};
use crate::idmap::IdMap;

#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    /// Additional read-only image stores consulted for lower paths.
    pub image_stores: Vec<PathBuf>,
    /// Default per-container quota in bytes; zero means unlimited.
    pub quota_size: u64,
    /// External mount helper; enables the helper backend when set.
    pub mount_program: Option<PathBuf>,
    /// When false, `home` is turned into a private mount at init.
    pub skip_mount_home: bool,
    /// Extra mount option string prepended to overlay mount data.
    pub mount_options: String,
    pub ignore_chown_errors: bool,
    /// Forced mode for layer upper directories.
    pub force_mask: Option<u32>,
}

impl DriverOptions {
    pub fn parse(options: &[String]) -> Result<Self> {
        let mut parsed = DriverOptions::default();
        for option in options {
            let (key, val) = option
                .split_once('=')
                .ok_or_else(|| LayerStoreError::MalformedOption(option.clone()))?;
            let key = key.to_ascii_lowercase();
            let key = key
                .trim_start_matches("overlay2.")
                .trim_start_matches("overlay.")
                .trim_start_matches('.');
            match key {
                "override_kernel_check" => {
                    tracing::debug!(
                        "overlay: override_kernel_check option was specified, but is no longer necessary"
                    );
                }
                "mountopt" => parsed.mount_options = val.to_string(),
                "size" => {
                    tracing::debug!("overlay: size={}", val);
                    parsed.quota_size = parse_size(val)?;
                }
                "imagestore" | "additionalimagestore" => {
                    tracing::debug!("overlay: imagestore={}", val);
                    if val.is_empty() {
                        continue;
                    }
                    for store in val.split(',') {
                        let store = super::layout::clean_path(Path::new(store));
                        if !store.is_absolute() {
                            return Err(LayerStoreError::InvalidOptionValue {
                                key: key.to_string(),
                                value: store.display().to_string(),
                            });
                        }
                        let meta = std::fs::metadata(&store)
                            .map_err(|e| LayerStoreError::path_ctx(&store, e))?;
                        if !meta.is_dir() {
                            return Err(LayerStoreError::InvalidOptionValue {
                                key: key.to_string(),
                                value: store.display().to_string(),
                            });
                        }
                        parsed.image_stores.push(store);
                    }
                }
                "mount_program" => {
                    tracing::debug!("overlay: mount_program={}", val);
                    let program = PathBuf::from(val);
                    std::fs::metadata(&program)
                        .map_err(|e| LayerStoreError::path_ctx(&program, e))?;
                    parsed.mount_program = Some(program);
                }
                "skip_mount_home" => {
                    tracing::debug!("overlay: skip_mount_home={}", val);
                    parsed.skip_mount_home = parse_bool(key, val)?;
                }
                "ignore_chown_errors" => {
                    tracing::debug!("overlay: ignore_chown_errors={}", val);
                    parsed.ignore_chown_errors = parse_bool(key, val)?;
                }
                "force_mask" => {
                    tracing::debug!("overlay: force_mask={}", val);
                    let mask = match val {
                        "shared" => 0o755,
                        "private" => 0o700,
                        _ => u32::from_str_radix(val, 8).map_err(|_| {
                            LayerStoreError::InvalidOptionValue {
                                key: key.to_string(),
                                value: val.to_string(),
                            }
                        })?,
                    };
                    parsed.force_mask = Some(mask);
                }
                _ => return Err(LayerStoreError::UnknownOption(key.to_string())),
            }
        }
        Ok(parsed)
    }
}

fn parse_bool(key: &str, val: &str) -> Result<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => Err(LayerStoreError::InvalidOptionValue {
            key: key.to_string(),
            value: val.to_string(),
        }),
    }
}

/// Parses a human-readable byte size with binary multiples: `1024`, `32k`,
/// `20G`, `1.5gb`, `4GiB`.
pub fn parse_size(value: &str) -> Result<u64> {
    let s = value.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let num: f64 = num
        .parse()
        .map_err(|_| LayerStoreError::InvalidSize(value.to_string()))?;

    let mut unit = suffix.trim().to_ascii_lowercase();
    if let Some(stripped) = unit.strip_suffix("ib") {
        unit = stripped.to_string();
    } else if let Some(stripped) = unit.strip_suffix('b') {
        unit = stripped.to_string();
    }
    let multiplier: u64 = match unit.as_str() {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        "p" => 1 << 50,
        _ => return Err(LayerStoreError::InvalidSize(value.to_string())),
    };
    Ok((num * multiplier as f64) as u64)
}

/// Per-layer storage options accepted at create time. Only `size` is
/// recognized; it overrides the driver's default quota for this layer.
pub fn parse_storage_opt(storage_opt: &HashMap<String, String>) -> Result<u64> {
    let mut size = 0;
    for (key, val) in storage_opt {
        match key.to_ascii_lowercase().as_str() {
            "size" => size = parse_size(val)?,
            other => return Err(LayerStoreError::UnknownOption(other.to_string())),
        }
    }
    Ok(size)
}

/// Options for mounting a layer via `get`.
#[derive(Debug, Clone, Default)]
pub struct MountOpts {
    /// SELinux label appended to the mount data as `context="..."`.
    pub mount_label: String,
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    /// Raw mount options; `ro` selects a read-only mount.
    pub options: Vec<String>,
}

/// Options for creating a layer.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub mappings: Option<crate::idmap::IdMappings>,
    pub storage_opt: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_plain_and_suffixed() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("32k").unwrap(), 32 << 10);
        assert_eq!(parse_size("20G").unwrap(), 20 << 30);
        assert_eq!(parse_size("1.5m").unwrap(), 3 << 19);
        assert_eq!(parse_size("4GiB").unwrap(), 4 << 30);
        assert_eq!(parse_size("10MB").unwrap(), 10 << 20);
        assert!(parse_size("banana").is_err());
        assert!(parse_size("10q").is_err());
    }

    #[test]
    fn test_parse_bool_values() {
        assert!(parse_bool("k", "true").unwrap());
        assert!(parse_bool("k", "1").unwrap());
        assert!(parse_bool("k", "T").unwrap());
        assert!(!parse_bool("k", "false").unwrap());
        assert!(!parse_bool("k", "0").unwrap());
        assert!(parse_bool("k", "yes").is_err());
    }

    #[test]
    fn test_parse_storage_opt_rejects_unknown_keys() {
        let mut opts = HashMap::new();
        opts.insert("size".to_string(), "1g".to_string());
        assert_eq!(parse_storage_opt(&opts).unwrap(), 1 << 30);

        opts.insert("banana".to_string(), "1".to_string());
        assert!(parse_storage_opt(&opts).is_err());
    }
}
