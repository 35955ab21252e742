use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::RecipeConfig;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::fs::FileSystem;
use crate::process::{CommandSpec, Executor};

/// A phase applied uniformly to every recipe location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Setup,
    Build,
    Link,
    Clean,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Build => "build",
            Stage::Link => "link",
            Stage::Clean => "clean",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directory holding a recipe file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecipeLocation(PathBuf);

impl RecipeLocation {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for RecipeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

pub struct StageExecutor<'a> {
    fs: &'a dyn FileSystem,
    exec: &'a dyn Executor,
    recipes: &'a RecipeConfig,
}

impl<'a> StageExecutor<'a> {
    pub fn new(fs: &'a dyn FileSystem, exec: &'a dyn Executor, recipes: &'a RecipeConfig) -> Self {
        Self { fs, exec, recipes }
    }

    /// Every directory under `source_root` (inclusive) that holds a recipe
    /// file, matched case-insensitively, in lexicographic path order.
    pub fn discover(&self, source_root: &Path) -> Result<Vec<RecipeLocation>> {
        if !self.fs.is_dir(source_root) {
            tracing::warn!(
                root = %source_root.display(),
                "source root is missing; no recipes to run"
            );
            return Ok(Vec::new());
        }

        let wanted = self.recipes.file_name.to_lowercase();
        let mut found = BTreeSet::new();
        for entry in self.fs.walk(source_root)? {
            if entry.is_dir() {
                continue;
            }
            let Some(name) = entry.path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.to_lowercase() != wanted {
                continue;
            }
            if let Some(dir) = entry.path.parent() {
                found.insert(RecipeLocation(dir.to_path_buf()));
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Invoke `stage` at every recipe location, halting at the first failure.
    pub fn run_stage(&self, ctx: &ExecCtx, source_root: &Path, stage: Stage) -> Result<()> {
        let locations = self.discover(source_root)?;
        if locations.is_empty() {
            tracing::info!(%stage, root = %source_root.display(), "no recipes found");
            ctx.log(&format!("stage {stage}: no recipes under {}", source_root.display()));
            return Ok(());
        }

        tracing::info!(%stage, count = locations.len(), "running stage");
        for loc in &locations {
            let cmd = CommandSpec::from_argv(&self.recipes.command)?
                .arg(stage.as_str())
                .current_dir(loc.path());
            ctx.log(&format!("stage {stage}: {loc}"));
            self.exec
                .run(&cmd, ctx)
                .map_err(|e| Error::recipe(loc.path(), stage, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::executor::MemorySink;
    use crate::fs::MemFs;
    use crate::process::RecordingExecutor;

    fn ctx() -> ExecCtx {
        ExecCtx::new(false, Arc::new(MemorySink::default()))
    }

    fn tree() -> MemFs {
        let fs = MemFs::new();
        fs.add_file("/w/src/kernel/Makefile", "")
            .add_file("/w/src/boot/makefile", "")
            .add_file("/w/src/programs/shell/MAKEFILE", "")
            .add_file("/w/src/programs/shell/main.c", "")
            .add_file("/w/src/libs/README", "")
            .add_file("/w/src/Makefile.inc", "");
        fs
    }

    #[test]
    fn discovers_recipes_case_insensitively_in_sorted_order() {
        let fs = tree();
        let exec = RecordingExecutor::new();
        let recipes = RecipeConfig::default();
        let stages = StageExecutor::new(&fs, &exec, &recipes);

        let found: Vec<PathBuf> = stages
            .discover(Path::new("/w/src"))
            .expect("discover")
            .iter()
            .map(|l| l.path().to_path_buf())
            .collect();
        assert_eq!(
            found,
            vec![
                PathBuf::from("/w/src/boot"),
                PathBuf::from("/w/src/kernel"),
                PathBuf::from("/w/src/programs/shell"),
            ]
        );
    }

    #[test]
    fn two_recipe_spellings_in_one_dir_are_one_location() {
        let fs = MemFs::new();
        fs.add_file("/w/src/a/Makefile", "")
            .add_file("/w/src/a/makefile", "");
        let exec = RecordingExecutor::new();
        let recipes = RecipeConfig::default();
        let stages = StageExecutor::new(&fs, &exec, &recipes);

        stages
            .run_stage(&ctx(), Path::new("/w/src"), Stage::Build)
            .expect("stage");
        assert_eq!(exec.calls().len(), 1);
    }

    #[test]
    fn empty_tree_is_a_successful_no_op() {
        let fs = MemFs::new();
        fs.add_dir("/w/src");
        let exec = RecordingExecutor::new();
        let recipes = RecipeConfig::default();
        let stages = StageExecutor::new(&fs, &exec, &recipes);

        stages
            .run_stage(&ctx(), Path::new("/w/src"), Stage::Build)
            .expect("no-op");
        assert!(exec.calls().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn link_back_to_an_ancestor_does_not_repeat_or_abort_discovery() {
        use crate::fs::HostFs;

        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("a")).expect("mkdir");
        std::fs::write(src.join("a/Makefile"), "").expect("write");
        std::os::unix::fs::symlink("..", src.join("a/up")).expect("symlink");

        let fs = HostFs;
        let exec = RecordingExecutor::new();
        let recipes = RecipeConfig::default();
        let stages = StageExecutor::new(&fs, &exec, &recipes);

        stages
            .run_stage(&ctx(), &src, Stage::Build)
            .expect("stage");
        assert_eq!(exec.working_dirs(), vec![src.join("a")]);
    }

    #[test]
    fn missing_source_root_is_a_no_op() {
        let fs = MemFs::new();
        let exec = RecordingExecutor::new();
        let recipes = RecipeConfig::default();
        let stages = StageExecutor::new(&fs, &exec, &recipes);

        stages
            .run_stage(&ctx(), Path::new("/w/src"), Stage::Clean)
            .expect("no-op");
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn invokes_recipe_command_with_stage_in_each_location() {
        let fs = tree();
        let exec = RecordingExecutor::new();
        let recipes = RecipeConfig::default();
        let stages = StageExecutor::new(&fs, &exec, &recipes);

        stages
            .run_stage(&ctx(), Path::new("/w/src"), Stage::Link)
            .expect("stage");
        let calls = exec.calls();
        assert_eq!(calls.len(), 3);
        for call in &calls {
            assert_eq!(call.program, "make");
            assert_eq!(call.args, vec!["link"]);
        }
        assert_eq!(
            exec.working_dirs(),
            vec![
                PathBuf::from("/w/src/boot"),
                PathBuf::from("/w/src/kernel"),
                PathBuf::from("/w/src/programs/shell"),
            ]
        );
    }

    #[test]
    fn first_failure_halts_remaining_locations() {
        let fs = tree();
        let exec = RecordingExecutor::new().fail_in("/w/src/kernel");
        let recipes = RecipeConfig::default();
        let stages = StageExecutor::new(&fs, &exec, &recipes);

        let err = stages
            .run_stage(&ctx(), Path::new("/w/src"), Stage::Build)
            .unwrap_err();
        match err {
            Error::Recipe {
                location, stage, ..
            } => {
                assert_eq!(location, PathBuf::from("/w/src/kernel"));
                assert_eq!(stage, Stage::Build);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            exec.working_dirs(),
            vec![PathBuf::from("/w/src/boot"), PathBuf::from("/w/src/kernel")]
        );
    }

    #[test]
    fn custom_recipe_command_keeps_its_arguments() {
        let fs = tree();
        let exec = RecordingExecutor::new();
        let recipes = RecipeConfig {
            file_name: "makefile".into(),
            command: vec!["make".into(), "-s".into()],
        };
        let stages = StageExecutor::new(&fs, &exec, &recipes);

        stages
            .run_stage(&ctx(), Path::new("/w/src/kernel"), Stage::Setup)
            .expect("stage");
        assert_eq!(exec.calls()[0].args, vec!["-s", "setup"]);
    }
}
