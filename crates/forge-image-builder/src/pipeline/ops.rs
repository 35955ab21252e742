use forge_image_builder_macros::Operation;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::pipeline::Pipeline;
use crate::stage::Stage;
use crate::workspace;

#[Operation(
    id = "pipeline.clean",
    phase = "clean",
    default_label = "Remove outputs and clean components"
)]
pub struct CleanOp;

impl CleanOp {
    fn run(p: &Pipeline<'_>, ctx: &mut ExecCtx) -> Result<()> {
        workspace::remove_output_dirs(p.fs, p.paths)?;
        p.stages().run_stage(ctx, &p.paths.src_dir, Stage::Clean)
    }
}

#[Operation(
    id = "pipeline.setup",
    phase = "setup",
    after = ["pipeline.clean?"],
    default_label = "Prepare output dirs, bootloader and components"
)]
pub struct SetupOp;

impl SetupOp {
    fn run(p: &Pipeline<'_>, ctx: &mut ExecCtx) -> Result<()> {
        workspace::ensure_output_dirs(p.fs, p.paths)?;

        if p.config.bootloader.enabled {
            let cmd = p.bootloader_command()?;
            ctx.log(&format!("bootloader: {cmd}"));
            p.exec
                .run(&cmd, ctx)
                .map_err(|e| Error::tool("bootloader build", e))?;
        }

        p.stages().run_stage(ctx, &p.paths.src_dir, Stage::Setup)
    }
}

#[Operation(
    id = "pipeline.build",
    phase = "build",
    after = ["pipeline.clean?", "pipeline.setup?"],
    default_label = "Build components"
)]
pub struct BuildOp;

impl BuildOp {
    fn run(p: &Pipeline<'_>, ctx: &mut ExecCtx) -> Result<()> {
        p.stages().run_stage(ctx, &p.paths.src_dir, Stage::Build)
    }
}

#[Operation(
    id = "pipeline.link",
    phase = "link",
    after = ["pipeline.clean?", "pipeline.setup?", "pipeline.build?"],
    default_label = "Link components"
)]
pub struct LinkOp;

impl LinkOp {
    fn run(p: &Pipeline<'_>, ctx: &mut ExecCtx) -> Result<()> {
        p.stages().run_stage(ctx, &p.paths.src_dir, Stage::Link)
    }
}

#[Operation(
    id = "pipeline.deploy",
    phase = "deploy",
    after = [
        "pipeline.clean?",
        "pipeline.setup?",
        "pipeline.build?",
        "pipeline.link?"
    ],
    default_label = "Assemble disk image"
)]
pub struct DeployOp;

impl DeployOp {
    fn run(p: &Pipeline<'_>, ctx: &mut ExecCtx) -> Result<()> {
        let image = &p.config.image;
        let specs = p.mirror_specs()?;
        let images = p.images();

        let mut handle = images.create_image(&p.image_path(), image.size_bytes()?)?;
        images.format_image(&mut handle, image.filesystem, &image.label, ctx)?;
        for spec in &specs {
            let report = images.mirror_into(&mut handle, spec, ctx)?;
            ctx.log(&format!(
                "mirrored {}: {} dirs, {} files",
                spec.host.display(),
                report.dirs_created,
                report.files_copied
            ));
        }
        ctx.log(&format!("image ready: {}", handle.path().display()));
        Ok(())
    }
}

#[Operation(
    id = "pipeline.run",
    phase = "run",
    after = [
        "pipeline.clean?",
        "pipeline.setup?",
        "pipeline.build?",
        "pipeline.link?",
        "pipeline.deploy?"
    ],
    default_label = "Boot image in virtual machine"
)]
pub struct RunOp;

impl RunOp {
    fn run(p: &Pipeline<'_>, ctx: &mut ExecCtx) -> Result<()> {
        let image = p.image_path();
        if !p.fs.exists(&image) {
            return Err(Error::tool(
                p.config.vm.binary.clone(),
                format!("image {} not found; run deploy first", image.display()),
            ));
        }
        let cmd = p.vm_command()?;
        ctx.log(&format!("vm: {cmd}"));
        p.exec
            .run(&cmd, ctx)
            .map_err(|e| Error::tool(p.config.vm.binary.clone(), e))
    }
}
