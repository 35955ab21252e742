//! Named high-level operations (clean, setup, build, link, deploy, run, all)
//! composed from the stage and image engines.

use std::fmt;
use std::path::PathBuf;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::TaskRegistry;
use crate::fs::FileSystem;
use crate::image::{ImageBuilder, ImageTool, MirrorSpec};
use crate::planner::Plan;
use crate::process::{CommandSpec, Executor};
use crate::stage::StageExecutor;
use crate::workspace::WorkspacePaths;

pub mod ops;

/// A user-selectable operation. Selected operations always run in the
/// declaration order below, whatever order they were requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Clean,
    Setup,
    Build,
    Link,
    Deploy,
    Run,
    /// Build, link and deploy.
    All,
}

impl Operation {
    fn plan_into(self, plan: &mut Plan) -> Result<()> {
        match self {
            Operation::Clean => ops::CleanOp::plan(plan),
            Operation::Setup => ops::SetupOp::plan(plan),
            Operation::Build => ops::BuildOp::plan(plan),
            Operation::Link => ops::LinkOp::plan(plan),
            Operation::Deploy => ops::DeployOp::plan(plan),
            Operation::Run => ops::RunOp::plan(plan),
            Operation::All => {
                ops::BuildOp::plan(plan)?;
                ops::LinkOp::plan(plan)?;
                ops::DeployOp::plan(plan)
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Clean => "clean",
            Operation::Setup => "setup",
            Operation::Build => "build",
            Operation::Link => "link",
            Operation::Deploy => "deploy",
            Operation::Run => "run",
            Operation::All => "all",
        };
        f.write_str(s)
    }
}

/// Plan for a set of requested operations. Duplicates collapse.
pub fn plan_for(selected: &[Operation]) -> Result<Plan> {
    let mut plan = Plan::default();
    for op in selected {
        op.plan_into(&mut plan)?;
    }
    Ok(plan)
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    ops::CleanOp::register(&mut reg)?;
    ops::SetupOp::register(&mut reg)?;
    ops::BuildOp::register(&mut reg)?;
    ops::LinkOp::register(&mut reg)?;
    ops::DeployOp::register(&mut reg)?;
    ops::RunOp::register(&mut reg)?;
    Ok(reg)
}

/// Everything an operation needs: resolved configuration plus the
/// filesystem, process and image capabilities.
pub struct Pipeline<'a> {
    pub config: &'a Config,
    pub paths: &'a WorkspacePaths,
    pub fs: &'a dyn FileSystem,
    pub exec: &'a dyn Executor,
    pub image_tool: &'a dyn ImageTool,
}

impl<'a> Pipeline<'a> {
    pub fn stages(&self) -> StageExecutor<'a> {
        StageExecutor::new(self.fs, self.exec, &self.config.recipes)
    }

    pub fn images(&self) -> ImageBuilder<'a> {
        ImageBuilder::new(self.fs, self.image_tool)
    }

    pub fn image_path(&self) -> PathBuf {
        self.paths.bin_dir.join(&self.config.image.name)
    }

    /// Configured mirrors with host paths resolved against the workspace.
    pub fn mirror_specs(&self) -> Result<Vec<MirrorSpec>> {
        self.config
            .image
            .mirrors
            .iter()
            .map(|m| {
                Ok(MirrorSpec::new(
                    self.paths.resolve_config_path(&m.host)?,
                    m.dest.clone(),
                ))
            })
            .collect()
    }

    pub fn bootloader_command(&self) -> Result<CommandSpec> {
        let cfg = &self.config.bootloader;
        let dir = self.paths.resolve_config_path(&cfg.dir)?;
        Ok(CommandSpec::from_argv(&cfg.command)?.current_dir(dir))
    }

    pub fn vm_command(&self) -> Result<CommandSpec> {
        let vm = &self.config.vm;
        if vm.binary.trim().is_empty() {
            return Err(Error::msg("vm.binary is empty"));
        }
        let code = self.paths.resolve_config_path(&vm.firmware_code)?;
        let vars = self.paths.resolve_config_path(&vm.firmware_vars)?;
        Ok(CommandSpec::new(vm.binary.clone())
            .arg("-drive")
            .arg(format!("file={},format=raw", self.image_path().display()))
            .arg("-m")
            .arg(vm.memory.clone())
            .arg("-smp")
            .arg(vm.cpus.to_string())
            .arg("-serial")
            .arg("stdio")
            .arg("-drive")
            .arg(format!(
                "if=pflash,format=raw,unit=0,readonly=on,file={}",
                code.display()
            ))
            .arg("-drive")
            .arg(format!("if=pflash,format=raw,unit=1,file={}", vars.display()))
            .args(vm.extra_args.iter().cloned())
            .current_dir(self.paths.root.clone()))
    }
}
