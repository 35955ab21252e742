use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fs::FileSystem;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    pub root_dir: String,
    /// Scanned for recipes.
    pub src_dir: String,
    /// Final image and per-component binaries.
    pub bin_dir: String,
    /// Intermediate artifacts.
    pub build_dir: String,
    /// Tree mirrored to the image root.
    pub rootfs_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: ".".into(),
            src_dir: "src".into(),
            bin_dir: "bin".into(),
            build_dir: "build".into(),
            rootfs_dir: "root".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub src_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub build_dir: PathBuf,
    pub rootfs_dir: PathBuf,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl WorkspacePaths {
    /// Output directories owned by the pipeline, in removal order.
    pub fn output_dirs(&self) -> [&Path; 2] {
        [&self.bin_dir, &self.build_dir]
    }

    pub fn error_logs_dir(&self) -> PathBuf {
        self.build_dir.join("error-logs")
    }

    // Resolve a user-configured path:
    // - `@alias/...` expands from the named workspace dirs (root, src, bin, build, rootfs)
    // - absolute paths are used as-is
    // - relative paths are rooted at the workspace root
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::msg("empty path"));
        }

        if let Some(after_at) = raw.strip_prefix('@') {
            let (alias, rest) = match after_at.split_once('/') {
                Some((a, r)) => (a.trim(), Some(r)),
                None => (after_at.trim(), None),
            };
            let base = self.named_dirs.get(alias).ok_or_else(|| {
                let known = self.named_dirs.keys().cloned().collect::<Vec<_>>().join(", ");
                Error::msg(format!(
                    "unknown workspace path alias '{alias}' in '{raw}' (known: {known})"
                ))
            })?;
            return Ok(match rest {
                Some(r) if !r.is_empty() => base.join(r),
                _ => base.clone(),
            });
        }

        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() { pb } else { self.root.join(pb) })
    }
}

/// Resolve the configured layout against `base` (normally the current dir).
pub fn load_paths(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let root = resolve_user_path(base, &cfg.root_dir)?;
    let src_dir = resolve_user_dir(&root, &cfg.src_dir)?;
    let bin_dir = resolve_user_dir(&root, &cfg.bin_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let rootfs_dir = resolve_user_dir(&root, &cfg.rootfs_dir)?;

    let mut named_dirs = BTreeMap::new();
    named_dirs.insert("root".to_string(), root.clone());
    named_dirs.insert("src".to_string(), src_dir.clone());
    named_dirs.insert("bin".to_string(), bin_dir.clone());
    named_dirs.insert("build".to_string(), build_dir.clone());
    named_dirs.insert("rootfs".to_string(), rootfs_dir.clone());

    Ok(WorkspacePaths {
        root,
        src_dir,
        bin_dir,
        build_dir,
        rootfs_dir,
        named_dirs,
    })
}

/// Create the output directories if absent.
pub fn ensure_output_dirs(fs: &dyn FileSystem, paths: &WorkspacePaths) -> Result<()> {
    for dir in paths.output_dirs() {
        if fs.is_dir(dir) {
            continue;
        }
        tracing::info!(dir = %dir.display(), "creating output dir");
        fs.create_dir_all(dir)?;
    }
    Ok(())
}

/// Remove the output directories if present. Absence is not an error.
pub fn remove_output_dirs(fs: &dyn FileSystem, paths: &WorkspacePaths) -> Result<()> {
    for dir in paths.output_dirs() {
        safe_remove_dir_all(fs, &paths.root, dir)?;
    }
    Ok(())
}

fn safe_remove_dir_all(fs: &dyn FileSystem, root: &Path, dir: &Path) -> Result<()> {
    if !fs.exists(dir) {
        return Ok(());
    }
    if dir == root || !dir.starts_with(root) {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (not inside workspace root '{}')",
            dir.display(),
            root.display()
        )));
    }
    tracing::info!(dir = %dir.display(), "removing output dir");
    fs.remove_dir_all(dir)
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace dir"));
    }
    let pb = PathBuf::from(p);
    if pb.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::msg(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    let joined = if pb.is_absolute() { pb } else { base.join(pb) };
    // Drop `.` components so `root.join("bin")` stays comparable with `starts_with`.
    Ok(joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}
