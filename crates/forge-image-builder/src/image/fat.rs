use std::path::Path;

use crate::error::Result;
use crate::executor::ExecCtx;
use crate::image::{FilesystemKind, ImageTool};
use crate::process::{CommandSpec, Executor};

/// `mkfs.fat` for formatting, mtools (`mmd`, `mcopy`) for population.
pub struct FatTools<'a> {
    exec: &'a dyn Executor,
    pub mkfs: String,
    pub mmd: String,
    pub mcopy: String,
}

impl<'a> FatTools<'a> {
    pub fn new(exec: &'a dyn Executor) -> Self {
        Self {
            exec,
            mkfs: "mkfs.fat".into(),
            mmd: "mmd".into(),
            mcopy: "mcopy".into(),
        }
    }

    fn mtools(&self, program: &str, image: &Path) -> CommandSpec {
        // Raw images have no partition table; skip the geometry sanity check.
        CommandSpec::new(program)
            .env("MTOOLS_SKIP_CHECK", "1")
            .arg("-i")
            .arg(image.display().to_string())
    }
}

impl ImageTool for FatTools<'_> {
    fn format(
        &self,
        image: &Path,
        kind: FilesystemKind,
        label: &str,
        ctx: &ExecCtx,
    ) -> Result<()> {
        let cmd = CommandSpec::new(&self.mkfs)
            .arg("-F")
            .arg(kind.fat_bits().to_string())
            .arg("-n")
            .arg(label)
            .arg(image.display().to_string());
        self.exec.run(&cmd, ctx)
    }

    fn make_directory(&self, image: &Path, inside: &str, ctx: &ExecCtx) -> Result<()> {
        let cmd = self.mtools(&self.mmd, image).arg(format!("::/{inside}"));
        self.exec.run(&cmd, ctx)
    }

    fn copy_file(
        &self,
        image: &Path,
        host_file: &Path,
        inside: &str,
        ctx: &ExecCtx,
    ) -> Result<()> {
        let cmd = self
            .mtools(&self.mcopy, image)
            .arg("-o")
            .arg(host_file.display().to_string())
            .arg(format!("::/{inside}"));
        self.exec.run(&cmd, ctx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::executor::MemorySink;
    use crate::process::RecordingExecutor;

    fn ctx() -> ExecCtx {
        ExecCtx::new(false, Arc::new(MemorySink::default()))
    }

    #[test]
    fn format_selects_fat_width_and_label() {
        let exec = RecordingExecutor::new();
        let tools = FatTools::new(&exec);
        tools
            .format(Path::new("bin/os.img"), FilesystemKind::Fat16, "OSIMAGE", &ctx())
            .expect("format");
        let calls = exec.calls();
        assert_eq!(calls[0].program, "mkfs.fat");
        assert_eq!(calls[0].args, vec!["-F", "16", "-n", "OSIMAGE", "bin/os.img"]);
    }

    #[test]
    fn mirror_primitives_address_image_paths() {
        let exec = RecordingExecutor::new();
        let tools = FatTools::new(&exec);
        let img = Path::new("bin/os.img");
        tools.make_directory(img, "efi/boot", &ctx()).expect("mmd");
        tools
            .copy_file(img, Path::new("bin/efi/boot/bootx64.efi"), "efi/boot/bootx64.efi", &ctx())
            .expect("mcopy");

        let calls = exec.calls();
        assert_eq!(calls[0].program, "mmd");
        assert_eq!(calls[0].args, vec!["-i", "bin/os.img", "::/efi/boot"]);
        assert_eq!(calls[1].program, "mcopy");
        assert_eq!(
            calls[1].args,
            vec![
                "-i",
                "bin/os.img",
                "-o",
                "bin/efi/boot/bootx64.efi",
                "::/efi/boot/bootx64.efi"
            ]
        );
        assert!(
            calls[1]
                .env
                .contains(&("MTOOLS_SKIP_CHECK".to_string(), "1".to_string()))
        );
    }
}
