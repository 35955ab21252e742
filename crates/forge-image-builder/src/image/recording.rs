use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::image::{FilesystemKind, ImageTool};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOp {
    Format {
        image: PathBuf,
        kind: FilesystemKind,
        label: String,
    },
    MakeDir(String),
    Copy {
        host: PathBuf,
        inside: String,
    },
}

/// An [`ImageTool`] that keeps an in-memory log of operations instead of
/// touching an image.
#[derive(Debug, Default)]
pub struct RecordingImageTool {
    ops: RefCell<Vec<ImageOp>>,
    fail_inside: Option<String>,
}

impl RecordingImageTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the directory creation or copy that targets `inside`.
    pub fn fail_on_inside(mut self, inside: impl Into<String>) -> Self {
        self.fail_inside = Some(inside.into());
        self
    }

    pub fn ops(&self) -> Vec<ImageOp> {
        self.ops.borrow().clone()
    }

    /// Operations after the most recent format.
    pub fn ops_after_format(&self) -> Vec<ImageOp> {
        let ops = self.ops.borrow();
        let start = ops
            .iter()
            .rposition(|op| matches!(op, ImageOp::Format { .. }))
            .map(|i| i + 1)
            .unwrap_or(0);
        ops[start..].to_vec()
    }

    pub fn created_dirs(&self) -> Vec<String> {
        self.ops
            .borrow()
            .iter()
            .filter_map(|op| match op {
                ImageOp::MakeDir(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn copied_paths(&self) -> Vec<String> {
        self.ops
            .borrow()
            .iter()
            .filter_map(|op| match op {
                ImageOp::Copy { inside, .. } => Some(inside.clone()),
                _ => None,
            })
            .collect()
    }

    /// Panics unless every directory and file was created after its parent.
    pub fn assert_no_orphans(&self) {
        let mut present = BTreeSet::from([String::new()]);
        for op in self.ops.borrow().iter() {
            let target = match op {
                ImageOp::Format { .. } => {
                    present = BTreeSet::from([String::new()]);
                    continue;
                }
                ImageOp::MakeDir(d) => d,
                ImageOp::Copy { inside, .. } => inside,
            };
            let parent = target.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            assert!(
                present.contains(parent),
                "'{target}' was written before its parent '{parent}'"
            );
            if let ImageOp::MakeDir(d) = op {
                present.insert(d.clone());
            }
        }
    }

    fn check(&self, inside: &str) -> Result<()> {
        if self.fail_inside.as_deref() == Some(inside) {
            return Err(Error::msg(format!("injected failure at ::/{inside}")));
        }
        Ok(())
    }
}

impl ImageTool for RecordingImageTool {
    fn format(
        &self,
        image: &Path,
        kind: FilesystemKind,
        label: &str,
        _ctx: &ExecCtx,
    ) -> Result<()> {
        self.ops.borrow_mut().push(ImageOp::Format {
            image: image.to_path_buf(),
            kind,
            label: label.to_string(),
        });
        Ok(())
    }

    fn make_directory(&self, _image: &Path, inside: &str, _ctx: &ExecCtx) -> Result<()> {
        self.ops
            .borrow_mut()
            .push(ImageOp::MakeDir(inside.to_string()));
        self.check(inside)
    }

    fn copy_file(
        &self,
        _image: &Path,
        host_file: &Path,
        inside: &str,
        _ctx: &ExecCtx,
    ) -> Result<()> {
        self.ops.borrow_mut().push(ImageOp::Copy {
            host: host_file.to_path_buf(),
            inside: inside.to_string(),
        });
        self.check(inside)
    }
}
