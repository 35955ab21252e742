use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::error::{Error, Result};
use crate::image::{FilesystemKind, MirrorSpecConfig};
use crate::workspace::WorkspaceConfig;

pub const DEFAULT_CONFIG_FILE: &str = "forge.toml";

/// Fully-resolved configuration. Built once at startup and passed around by
/// reference.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub recipes: RecipeConfig,
    pub bootloader: BootloaderConfig,
    pub image: ImageConfig,
    pub vm: VmConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecipeConfig {
    /// Recipe file name, matched case-insensitively.
    pub file_name: String,
    /// Program (plus leading args) run in each recipe location; the stage name
    /// is appended.
    pub command: Vec<String>,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            file_name: "Makefile".into(),
            command: vec!["make".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootloaderConfig {
    pub enabled: bool,
    /// Vendored bootloader dependency, relative to the workspace root.
    pub dir: String,
    pub command: Vec<String>,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: "gnu-efi".into(),
            command: vec!["make".into(), "all".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    /// File name inside the bin dir.
    pub name: String,
    pub size_mib: u64,
    pub filesystem: FilesystemKind,
    pub label: String,
    /// Mirrored in order.
    pub mirrors: Vec<MirrorSpecConfig>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: "os.img".into(),
            size_mib: 64,
            filesystem: FilesystemKind::Fat32,
            label: "OSIMAGE".into(),
            mirrors: vec![
                MirrorSpecConfig::new("@rootfs", ""),
                MirrorSpecConfig::new("@bin/efi", "efi"),
                MirrorSpecConfig::new("@bin/kernel", "kernel"),
                MirrorSpecConfig::new("@bin/programs", "programs"),
            ],
        }
    }
}

impl ImageConfig {
    pub fn size_bytes(&self) -> Result<u64> {
        self.size_mib
            .checked_mul(1024 * 1024)
            .filter(|n| *n > 0)
            .ok_or_else(|| Error::msg(format!("invalid image.size_mib {}", self.size_mib)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    pub binary: String,
    pub firmware_code: String,
    pub firmware_vars: String,
    pub memory: String,
    pub cpus: u32,
    pub extra_args: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".into(),
            firmware_code: "OVMF_CODE.fd".into(),
            firmware_vars: "OVMF_VARS.fd".into(),
            memory: "1G".into(),
            cpus: 2,
            extra_args: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_value(value: Value) -> Result<Self> {
        value
            .try_into()
            .map_err(|e| Error::msg(format!("invalid config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_value(load_value(path)?)
    }

    /// Load `path` when given; otherwise `forge.toml` under `base` if it
    /// exists, else defaults.
    pub fn load_or_default(path: Option<&Path>, base: &Path) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }
        let implicit = base.join(DEFAULT_CONFIG_FILE);
        if implicit.is_file() {
            tracing::debug!(path = %implicit.display(), "using implicit config");
            return Self::load(&implicit);
        }
        Ok(Self::default())
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// Read a TOML file, resolving `extends = "<file>"` (single parent) and
/// `imports = [...]` (deep-merged in order, local keys win). Paths are
/// relative to the referencing file.
pub fn load_value(path: &Path) -> Result<Value> {
    let mut stack = HashSet::<PathBuf>::new();
    load_value_inner(path, &mut stack)
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
    let Some(tbl) = value.as_table_mut() else {
        return Err(Error::msg(format!("{} is not a table", path.display())));
    };

    let extends = tbl.remove("extends");
    let imports = tbl.remove("imports");

    let mut out = Value::Table(Default::default());
    if let Some(ext) = extends {
        let Some(ext) = ext.as_str() else {
            return Err(Error::msg(format!(
                "invalid extends in {} (expected string)",
                path.display()
            )));
        };
        out = load_value_inner(&relative_to(path, ext), stack)?;
    }
    for imp in parse_imports(path, imports)? {
        let loaded = load_value_inner(&relative_to(path, &imp), stack)?;
        merge(&mut out, loaded);
    }
    merge(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

fn parse_imports(path: &Path, imports: Option<Value>) -> Result<Vec<String>> {
    let Some(imports) = imports else {
        return Ok(Vec::new());
    };
    let Some(arr) = imports.as_array() else {
        return Err(Error::msg(format!(
            "invalid imports in {} (expected array)",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn relative_to(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, body).expect("write config");
        p
    }

    #[test]
    fn defaults_describe_the_standard_layout() {
        let cfg = Config::default();
        assert_eq!(cfg.recipes.file_name, "Makefile");
        assert_eq!(cfg.bootloader.command, vec!["make", "all"]);
        assert_eq!(cfg.image.size_bytes().expect("size"), 64 * 1024 * 1024);
        let dests: Vec<&str> = cfg.image.mirrors.iter().map(|m| m.dest.as_str()).collect();
        assert_eq!(dests, vec!["", "efi", "kernel", "programs"]);
    }

    #[test]
    fn extends_and_imports_merge_with_local_keys_winning() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write(
            tmp.path(),
            "base.toml",
            r#"
[image]
size_mib = 128
label = "BASE"

[vm]
memory = "2G"
"#,
        );
        write(
            tmp.path(),
            "vm.toml",
            r#"
[vm]
cpus = 8
memory = "4G"
"#,
        );
        let top = write(
            tmp.path(),
            "forge.toml",
            r#"
extends = "base.toml"
imports = ["vm.toml"]

[image]
label = "TOP"
"#,
        );

        let cfg = Config::load(&top).expect("load");
        assert_eq!(cfg.image.size_mib, 128);
        assert_eq!(cfg.image.label, "TOP");
        assert_eq!(cfg.vm.cpus, 8);
        assert_eq!(cfg.vm.memory, "4G");
        assert_eq!(cfg.vm.binary, "qemu-system-x86_64");
    }

    #[test]
    fn import_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write(tmp.path(), "a.toml", "imports = [\"b.toml\"]\n");
        let b = write(tmp.path(), "b.toml", "imports = [\"a.toml\"]\n");

        let err = Config::load(&b).unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let value: Value = toml::from_str("[image]\nsize = 12\n").expect("toml");
        let err = Config::from_value(value).unwrap_err().to_string();
        assert!(err.contains("size"), "unexpected err: {err}");
    }

    #[test]
    fn mirrors_and_filesystem_parse_from_toml() {
        let value: Value = toml::from_str(
            r#"
[image]
filesystem = "fat16"

[[image.mirrors]]
host = "@rootfs"

[[image.mirrors]]
host = "@bin/efi"
dest = "efi/boot"
"#,
        )
        .expect("toml");
        let cfg = Config::from_value(value).expect("config");
        assert_eq!(cfg.image.filesystem, FilesystemKind::Fat16);
        assert_eq!(cfg.image.mirrors.len(), 2);
        assert_eq!(cfg.image.mirrors[0].dest, "");
        assert_eq!(cfg.image.mirrors[1].dest, "efi/boot");
    }

    #[test]
    fn missing_implicit_config_means_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = Config::load_or_default(None, tmp.path()).expect("defaults");
        assert_eq!(cfg.image.name, "os.img");
    }
}
