use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    /// Not traversed; the target may be a file, a directory or nothing.
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub kind: EntryKind,
    /// 0 for the walk root.
    pub depth: usize,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// Host filesystem operations used by the stage and image engines.
pub trait FileSystem {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// Direct children of `dir`, sorted by file name.
    fn list(&self, dir: &Path) -> Result<Vec<Entry>>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Create (or truncate) `path` as a zero-filled file of exactly `size` bytes.
    fn create_sized(&self, path: &Path, size: u64) -> Result<()>;

    /// Pre-order walk of `root`, root first, siblings sorted by file name.
    /// A directory is always yielded before anything inside it.
    fn walk(&self, root: &Path) -> Result<Vec<Entry>> {
        if !self.exists(root) {
            return Err(Error::msg(format!("{} does not exist", root.display())));
        }
        let kind = if self.is_dir(root) {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        let mut out = vec![Entry {
            path: root.to_path_buf(),
            kind,
            depth: 0,
        }];
        if kind == EntryKind::Dir {
            walk_children(self, root, 1, &mut out)?;
        }
        Ok(out)
    }
}

fn walk_children<F: FileSystem + ?Sized>(
    fs: &F,
    dir: &Path,
    depth: usize,
    out: &mut Vec<Entry>,
) -> Result<()> {
    for mut child in fs.list(dir)? {
        child.depth = depth;
        let descend = child.is_dir();
        let path = child.path.clone();
        out.push(child);
        if descend {
            walk_children(fs, &path, depth + 1, out)?;
        }
    }
    Ok(())
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFs;

impl FileSystem for HostFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list(&self, dir: &Path) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
            out.push(to_entry(&entry));
        }
        Ok(out)
    }

    fn walk(&self, root: &Path) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
            out.push(to_entry(&entry));
        }
        Ok(out)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", path.display())))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path)
            .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", path.display())))
    }

    fn create_sized(&self, path: &Path, size: u64) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.create_dir_all(parent)?;
        }
        let file = fs::File::create(path)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", path.display())))?;
        // Every byte is written so the space is reserved before formatting.
        let mut out = BufWriter::with_capacity(1 << 20, &file);
        let written = io::copy(&mut io::repeat(0).take(size), &mut out)
            .and_then(|n| out.flush().map(|()| n))
            .map_err(|e| {
                Error::msg(format!(
                    "failed to allocate {size} bytes for {}: {e}",
                    path.display()
                ))
            })?;
        if written != size {
            return Err(Error::msg(format!(
                "short write allocating {}: {written} of {size} bytes",
                path.display()
            )));
        }
        drop(out);
        file.sync_all()
            .map_err(|e| Error::msg(format!("failed to sync {}: {e}", path.display())))
    }
}

fn to_entry(entry: &walkdir::DirEntry) -> Entry {
    let ft = entry.file_type();
    let kind = if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File
    };
    Entry {
        path: entry.path().to_path_buf(),
        kind,
        depth: entry.depth(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MemNode {
    Dir,
    File(Vec<u8>),
}

/// In-memory filesystem keyed by absolute path.
#[derive(Debug, Default)]
pub struct MemFs {
    nodes: RefCell<BTreeMap<PathBuf, MemNode>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) -> &Self {
        self.insert_dirs(path.as_ref());
        self
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) -> &Self {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.insert_dirs(parent);
        }
        self.nodes
            .borrow_mut()
            .insert(path.to_path_buf(), MemNode::File(content.into()));
        self
    }

    pub fn file_len(&self, path: impl AsRef<Path>) -> Option<usize> {
        match self.nodes.borrow().get(path.as_ref()) {
            Some(MemNode::File(data)) => Some(data.len()),
            _ => None,
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.nodes.borrow().keys().cloned().collect()
    }

    fn insert_dirs(&self, path: &Path) {
        let mut nodes = self.nodes.borrow_mut();
        for anc in path.ancestors() {
            if anc.as_os_str().is_empty() {
                continue;
            }
            nodes.entry(anc.to_path_buf()).or_insert(MemNode::Dir);
        }
    }
}

impl FileSystem for MemFs {
    fn exists(&self, path: &Path) -> bool {
        self.nodes.borrow().contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        matches!(self.nodes.borrow().get(path), Some(MemNode::Dir))
    }

    fn list(&self, dir: &Path) -> Result<Vec<Entry>> {
        if !self.is_dir(dir) {
            return Err(Error::msg(format!("{} is not a directory", dir.display())));
        }
        let nodes = self.nodes.borrow();
        let out = nodes
            .iter()
            .filter(|(p, _)| p.parent() == Some(dir))
            .map(|(p, node)| Entry {
                path: p.clone(),
                kind: match node {
                    MemNode::Dir => EntryKind::Dir,
                    MemNode::File(_) => EntryKind::File,
                },
                depth: 1,
            })
            .collect();
        Ok(out)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        if let Some(MemNode::File(_)) = self.nodes.borrow().get(path) {
            return Err(Error::msg(format!(
                "failed to create dir {}: a file exists there",
                path.display()
            )));
        }
        self.insert_dirs(path);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        if !self.is_dir(path) {
            return Err(Error::msg(format!(
                "failed to remove dir {}: not found",
                path.display()
            )));
        }
        self.nodes.borrow_mut().retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn create_sized(&self, path: &Path, size: u64) -> Result<()> {
        if self.is_dir(path) {
            return Err(Error::msg(format!(
                "failed to create {}: is a directory",
                path.display()
            )));
        }
        let len = usize::try_from(size)
            .map_err(|_| Error::msg(format!("size {size} does not fit in memory")))?;
        self.add_file(path, vec![0u8; len]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel_paths(entries: &[Entry], root: &Path) -> Vec<String> {
        entries
            .iter()
            .map(|e| {
                e.path
                    .strip_prefix(root)
                    .expect("under root")
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[test]
    fn mem_walk_is_preorder_and_sorted() {
        let fs = MemFs::new();
        fs.add_file("/t/b/z.txt", "z")
            .add_file("/t/a/y.txt", "y")
            .add_file("/t/a.txt", "x")
            .add_dir("/t/a/inner");

        let root = Path::new("/t");
        let walked = fs.walk(root).expect("walk");
        assert_eq!(
            rel_paths(&walked, root),
            vec!["", "a", "a/inner", "a/y.txt", "a.txt", "b", "b/z.txt"]
        );
        assert_eq!(walked[0].depth, 0);
        assert_eq!(walked[2].depth, 2);
    }

    #[test]
    fn mem_walk_missing_root_errors() {
        let fs = MemFs::new();
        assert!(fs.walk(Path::new("/nope")).is_err());
    }

    #[test]
    fn mem_remove_dir_all_drops_descendants_only() {
        let fs = MemFs::new();
        fs.add_file("/w/bin/os.img", "img").add_file("/w/binary", "keep");
        fs.remove_dir_all(Path::new("/w/bin")).expect("remove");
        assert!(!fs.exists(Path::new("/w/bin")));
        assert!(!fs.exists(Path::new("/w/bin/os.img")));
        assert!(fs.exists(Path::new("/w/binary")));
    }

    #[test]
    fn host_walk_matches_mem_walk_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("a/inner")).expect("mkdir");
        fs::create_dir_all(root.join("b")).expect("mkdir");
        fs::write(root.join("a/y.txt"), "y").expect("write");
        fs::write(root.join("a.txt"), "x").expect("write");
        fs::write(root.join("b/z.txt"), "z").expect("write");

        let walked = HostFs.walk(root).expect("walk");
        assert_eq!(
            rel_paths(&walked, root),
            vec!["", "a", "a/inner", "a/y.txt", "a.txt", "b", "b/z.txt"]
        );
        assert!(walked[1].is_dir());
        assert!(!walked[3].is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn host_walk_reports_links_without_following_them() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("a")).expect("mkdir");
        fs::write(root.join("a/file"), "f").expect("write");
        std::os::unix::fs::symlink("..", root.join("a/up")).expect("symlink");

        let walked = HostFs.walk(root).expect("walk");
        assert_eq!(rel_paths(&walked, root), vec!["", "a", "a/file", "a/up"]);
        assert_eq!(walked[3].kind, EntryKind::Symlink);
        assert!(!walked[3].is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn host_create_sized_allocates_every_block() {
        use std::os::unix::fs::MetadataExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let img = tmp.path().join("os.img");
        let size = 1024 * 1024;
        HostFs.create_sized(&img, size).expect("create");

        let meta = fs::metadata(&img).expect("metadata");
        assert_eq!(meta.len(), size);
        assert!(
            meta.blocks() * 512 >= size,
            "only {} bytes allocated",
            meta.blocks() * 512
        );
    }

    #[test]
    fn host_create_sized_truncates_existing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let img = tmp.path().join("bin/os.img");
        fs::create_dir_all(img.parent().expect("parent")).expect("mkdir");
        fs::write(&img, vec![0xAAu8; 4096]).expect("write");

        HostFs.create_sized(&img, 1024).expect("create");
        let data = fs::read(&img).expect("read");
        assert_eq!(data.len(), 1024);
        assert!(data.iter().all(|b| *b == 0));
    }
}
