//! Raw disk image assembly: create a fixed-size file, format it, and mirror
//! host directory trees into it.
//!
//! The image contents are only ever touched through an [`ImageTool`], which
//! exposes the handful of primitives the builder needs (format, make a
//! directory, copy a file).

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::fs::{EntryKind, FileSystem};

pub mod fat;
pub mod recording;

pub use fat::FatTools;
pub use recording::{ImageOp, RecordingImageTool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    Fat12,
    Fat16,
    Fat32,
}

impl FilesystemKind {
    pub fn fat_bits(self) -> u8 {
        match self {
            FilesystemKind::Fat12 => 12,
            FilesystemKind::Fat16 => 16,
            FilesystemKind::Fat32 => 32,
        }
    }

    /// Smallest image the formatter can lay this filesystem onto.
    pub fn min_size(self) -> u64 {
        match self {
            FilesystemKind::Fat12 => 64 * 1024,
            FilesystemKind::Fat16 => 4 * 1024 * 1024,
            FilesystemKind::Fat32 => 33 * 1024 * 1024,
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FAT{}", self.fat_bits())
    }
}

/// `[[image.mirrors]]` entry; `host` may use workspace aliases (`@bin/efi`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorSpecConfig {
    pub host: String,
    #[serde(default)]
    pub dest: String,
}

impl MirrorSpecConfig {
    pub fn new(host: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            dest: dest.into(),
        }
    }
}

/// One host subtree to copy into the image. An empty `dest` is the image root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSpec {
    pub host: PathBuf,
    pub dest: String,
}

impl MirrorSpec {
    pub fn new(host: impl Into<PathBuf>, dest: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            dest: dest.into(),
        }
    }

    /// `dest` split into path components; leading/trailing slashes and `.`
    /// are ignored, `..` is rejected.
    pub fn dest_components(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for seg in self.dest.split('/') {
            match seg.trim() {
                "" | "." => continue,
                ".." => {
                    return Err(Error::msg(format!(
                        "mirror destination '{}' contains '..'",
                        self.dest
                    )));
                }
                s => out.push(s.to_string()),
            }
        }
        Ok(out)
    }
}

/// Path inside the image without the leading slash; "" is the root.
pub fn inside_display(inside: &str) -> String {
    format!("::/{inside}")
}

fn join_inside(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// FAT names compare case-insensitively.
fn dir_key(inside: &str) -> String {
    inside.to_ascii_lowercase()
}

fn parent_inside(inside: &str) -> &str {
    inside.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

/// Filesystem-mutation primitives for a raw image.
pub trait ImageTool {
    fn format(&self, image: &Path, kind: FilesystemKind, label: &str, ctx: &ExecCtx)
    -> Result<()>;

    /// Create one directory; its parent already exists.
    fn make_directory(&self, image: &Path, inside: &str, ctx: &ExecCtx) -> Result<()>;

    /// Copy a host file to `inside`, replacing any existing file.
    fn copy_file(&self, image: &Path, host_file: &Path, inside: &str, ctx: &ExecCtx)
    -> Result<()>;
}

/// An image file on disk plus what this run knows about its contents.
#[derive(Debug)]
pub struct ImageHandle {
    path: PathBuf,
    size: u64,
    filesystem: Option<FilesystemKind>,
    /// Directories known to exist, keyed by [`dir_key`].
    dirs: BTreeSet<String>,
}

impl ImageHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn filesystem(&self) -> Option<FilesystemKind> {
        self.filesystem
    }

    pub fn has_dir(&self, inside: &str) -> bool {
        self.dirs.contains(&dir_key(inside))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MirrorReport {
    pub dirs_created: usize,
    pub files_copied: usize,
}

pub struct ImageBuilder<'a> {
    fs: &'a dyn FileSystem,
    tool: &'a dyn ImageTool,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(fs: &'a dyn FileSystem, tool: &'a dyn ImageTool) -> Self {
        Self { fs, tool }
    }

    /// Allocate a zero-filled image of exactly `size` bytes, replacing any
    /// existing file at `path`.
    pub fn create_image(&self, path: &Path, size: u64) -> Result<ImageHandle> {
        if size == 0 {
            return Err(Error::image_io(path, "image size must be non-zero"));
        }
        if self.fs.is_dir(path) {
            return Err(Error::image_io(path, "a directory exists at the image path"));
        }
        self.fs
            .create_sized(path, size)
            .map_err(|e| Error::image_io(path, e))?;
        tracing::info!(image = %path.display(), size, "created raw image");
        Ok(ImageHandle {
            path: path.to_path_buf(),
            size,
            filesystem: None,
            dirs: BTreeSet::new(),
        })
    }

    pub fn format_image(
        &self,
        handle: &mut ImageHandle,
        kind: FilesystemKind,
        label: &str,
        ctx: &ExecCtx,
    ) -> Result<()> {
        let min = kind.min_size();
        if handle.size < min {
            return Err(Error::image_io(
                &handle.path,
                format!(
                    "image is {} bytes but {kind} needs at least {min}",
                    handle.size
                ),
            ));
        }
        validate_label(label)?;

        ctx.log(&format!("format {} as {kind}", handle.path.display()));
        self.tool
            .format(&handle.path, kind, label, ctx)
            .map_err(|e| Error::image_io(&handle.path, e))?;

        handle.filesystem = Some(kind);
        handle.dirs.clear();
        handle.dirs.insert(String::new());
        tracing::info!(image = %handle.path.display(), %kind, "formatted image");
        Ok(())
    }

    /// Copy `spec.host` into the image under `spec.dest`. Directories are
    /// created before anything inside them; the first failure stops the copy.
    pub fn mirror_into(
        &self,
        handle: &mut ImageHandle,
        spec: &MirrorSpec,
        ctx: &ExecCtx,
    ) -> Result<MirrorReport> {
        if handle.filesystem.is_none() {
            return Err(Error::image_io(&handle.path, "image is not formatted"));
        }
        let dest = spec
            .dest_components()
            .map_err(|e| Error::image_io(&spec.host, e))?;
        if !self.fs.is_dir(&spec.host) {
            return Err(Error::image_io(&spec.host, "host directory does not exist"));
        }
        let entries = self
            .fs
            .walk(&spec.host)
            .map_err(|e| Error::image_io(&spec.host, e))?;

        ctx.log(&format!(
            "mirror {} -> {}",
            spec.host.display(),
            inside_display(&dest.join("/"))
        ));
        let mut session = MirrorSession::open(handle, self.tool, ctx);

        let mut prefix = String::new();
        for seg in &dest {
            prefix = join_inside(&prefix, seg);
            session.ensure_dir(&prefix, &spec.host)?;
        }

        for entry in entries {
            let rel = entry
                .path
                .strip_prefix(&spec.host)
                .map_err(|e| Error::image_io(&entry.path, e))?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let inside = inside_path(&prefix, rel).map_err(|e| Error::image_io(&entry.path, e))?;
            match entry.kind {
                EntryKind::Dir => session.ensure_dir(&inside, &entry.path)?,
                EntryKind::File => session.copy_file(&entry.path, &inside)?,
                // FAT has no links: copy what a file link points at, skip directory links.
                EntryKind::Symlink if self.fs.is_dir(&entry.path) => {
                    tracing::warn!(link = %entry.path.display(), "skipping link to a directory");
                }
                EntryKind::Symlink => session.copy_file(&entry.path, &inside)?,
            }
        }

        let report = session.report;
        tracing::info!(
            host = %spec.host.display(),
            dest = %spec.dest,
            dirs = report.dirs_created,
            files = report.files_copied,
            "mirrored tree into image"
        );
        Ok(report)
    }
}

fn inside_path(prefix: &str, rel: &Path) -> Result<String> {
    let mut out = prefix.to_string();
    for c in rel.components() {
        let Component::Normal(seg) = c else {
            return Err(Error::msg(format!("unexpected path component in {}", rel.display())));
        };
        let Some(seg) = seg.to_str() else {
            return Err(Error::msg(format!("non UTF-8 file name in {}", rel.display())));
        };
        out = join_inside(&out, seg);
    }
    Ok(out)
}

fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() || label.len() > 11 || !label.is_ascii() {
        return Err(Error::msg(format!(
            "volume label '{label}' must be 1-11 ASCII characters"
        )));
    }
    Ok(())
}

/// Exclusive write access to an image for the duration of one mirror; the
/// `&mut` borrow rules out a second writer.
struct MirrorSession<'h> {
    handle: &'h mut ImageHandle,
    tool: &'h dyn ImageTool,
    ctx: &'h ExecCtx,
    report: MirrorReport,
}

impl<'h> MirrorSession<'h> {
    fn open(handle: &'h mut ImageHandle, tool: &'h dyn ImageTool, ctx: &'h ExecCtx) -> Self {
        tracing::debug!(image = %handle.path.display(), "acquired image");
        Self {
            handle,
            tool,
            ctx,
            report: MirrorReport::default(),
        }
    }

    fn ensure_dir(&mut self, inside: &str, host: &Path) -> Result<()> {
        if self.handle.dirs.contains(&dir_key(inside)) {
            return Ok(());
        }
        let parent = parent_inside(inside);
        if !self.handle.dirs.contains(&dir_key(parent)) {
            self.ensure_dir(parent, host)?;
        }
        tracing::debug!(dir = %inside_display(inside), "mkdir");
        self.tool
            .make_directory(&self.handle.path, inside, self.ctx)
            .map_err(|e| {
                Error::image_io(
                    host,
                    format!("failed to create {}: {e}", inside_display(inside)),
                )
            })?;
        self.handle.dirs.insert(dir_key(inside));
        self.report.dirs_created += 1;
        Ok(())
    }

    fn copy_file(&mut self, host: &Path, inside: &str) -> Result<()> {
        self.ensure_dir(parent_inside(inside), host)?;
        tracing::debug!(file = %inside_display(inside), "copy");
        self.tool
            .copy_file(&self.handle.path, host, inside, self.ctx)
            .map_err(|e| {
                Error::image_io(
                    host,
                    format!("failed to copy to {}: {e}", inside_display(inside)),
                )
            })?;
        self.report.files_copied += 1;
        Ok(())
    }
}

impl Drop for MirrorSession<'_> {
    fn drop(&mut self) {
        tracing::debug!(image = %self.handle.path.display(), "released image");
    }
}
