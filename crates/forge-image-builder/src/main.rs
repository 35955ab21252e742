use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use forge_image_builder::config::Config;
use forge_image_builder::executor::{ExecCtx, StdoutSink, execute_plan};
use forge_image_builder::fs::HostFs;
use forge_image_builder::image::FatTools;
use forge_image_builder::pipeline::{self, Operation, Pipeline};
use forge_image_builder::process::HostExecutor;
use forge_image_builder::{Error, Result, workspace};

#[derive(Debug, Parser)]
#[command(author, version, about = "Build, package and boot the OS image")]
struct Args {
    /// Remove bin/ and build/, then run the `clean` stage
    #[arg(short, long)]
    clean: bool,
    /// Create output dirs, build the vendored bootloader, run the `setup` stage
    #[arg(short, long)]
    setup: bool,
    /// Run the `build` stage
    #[arg(short, long)]
    build: bool,
    /// Run the `link` stage
    #[arg(short, long)]
    link: bool,
    /// Create, format and populate the disk image
    #[arg(short, long)]
    deploy: bool,
    /// Boot the disk image in a virtual machine
    #[arg(short, long)]
    run: bool,
    /// Build, link and deploy
    #[arg(short, long)]
    all: bool,
    /// Config file (defaults to ./forge.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Walk the plan without running anything
    #[arg(long)]
    dry_run: bool,
    /// Print the ordered task plan and exit
    #[arg(long)]
    plan: bool,
    /// Print every discovered recipe location and exit
    #[arg(long)]
    list_recipes: bool,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Args {
    fn selected(&self) -> Vec<Operation> {
        [
            (self.clean, Operation::Clean),
            (self.setup, Operation::Setup),
            (self.build, Operation::Build),
            (self.link, Operation::Link),
            (self.deploy, Operation::Deploy),
            (self.run, Operation::Run),
            (self.all, Operation::All),
        ]
        .into_iter()
        .filter_map(|(on, op)| on.then_some(op))
        .collect()
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(args: &Args) -> Result<()> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let config = Config::load_or_default(args.config.as_deref(), &cwd)?;
    let paths = workspace::load_paths(&config.workspace, &cwd)?;

    let fs = HostFs;
    let exec = HostExecutor;
    let tools = FatTools::new(&exec);
    let pipeline = Pipeline {
        config: &config,
        paths: &paths,
        fs: &fs,
        exec: &exec,
        image_tool: &tools,
    };

    if args.list_recipes {
        for loc in pipeline.stages().discover(&paths.src_dir)? {
            println!("{loc}");
        }
        return Ok(());
    }

    let selected = args.selected();
    if selected.is_empty() {
        Args::command().print_help()?;
        return Ok(());
    }

    let plan = pipeline::plan_for(&selected)?;
    if args.plan {
        for (i, task) in plan.ordered()?.iter().enumerate() {
            println!(
                "{:>2}. {:<18} {:<8} {}",
                i + 1,
                task.id,
                task.phase,
                task.label
            );
        }
        return Ok(());
    }

    let reg = pipeline::builtin_registry()?;
    let sink = Arc::new(StdoutSink::new(paths.error_logs_dir()));
    let mut ctx = ExecCtx::new(args.dry_run, sink);
    execute_plan(&pipeline, &plan, &reg, &mut ctx)
}
