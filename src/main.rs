use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use segfusion::{
    CaseId, Config, Error, Pipeline,
    enums::{CopyMode, OverrideMatch},
    fusion::{FusionOptions, fuse_files},
    stager::Stager,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "segfusion")]
#[command(about = "Dual-pass PET/CT segmentation with tumor label fusion")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "SEGFUSION_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset, e.g. `segfusion=debug`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage for one case: DICOM in, fused segmentation out
    RunPipeline(RunPipelineArgs),
    /// Fuse a base segmentation with a tumor override mask
    Fuse(FuseArgs),
    /// Build an isolated channel view of a case directory
    Stage(StageArgs),
}

#[derive(Args, Debug)]
struct RunPipelineArgs {
    /// CT DICOM series directory
    #[arg(long)]
    ct: PathBuf,
    /// PET DICOM series directory
    #[arg(long)]
    pet: PathBuf,
    #[arg(long)]
    case_id: String,
    #[arg(long)]
    output_root: Option<PathBuf>,
    #[arg(long)]
    scratch_root: Option<PathBuf>,
    /// Re-run stages whose outputs already exist
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct FuseArgs {
    /// Multi-class base segmentation (pass A)
    #[arg(long)]
    base: PathBuf,
    /// Tumor override segmentation (pass B)
    #[arg(long = "override")]
    overlay: PathBuf,
    #[arg(long)]
    out: PathBuf,
    /// Defaults to `tumor_label` from the configuration
    #[arg(long)]
    tumor_label: Option<u32>,
    /// 1 keeps the base tumor when the override is empty, 0 erases it
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    keep_base_if_override_empty: Option<u8>,
    /// Treat every non-zero override voxel as tumor
    #[arg(long)]
    override_any_nonzero: bool,
}

impl FuseArgs {
    /// Command-line values win; anything not given comes from `config`.
    fn options(&self, config: &Config) -> FusionOptions {
        let mode = if self.override_any_nonzero {
            OverrideMatch::AnyNonZero
        } else {
            config.override_match
        };
        FusionOptions::new(self.tumor_label.unwrap_or(config.tumor_label))
            .keep_base_if_override_empty(
                self.keep_base_if_override_empty
                    .map_or(config.keep_base_if_override_empty, |keep| keep == 1),
            )
            .override_match(mode)
    }
}

#[derive(Args, Debug)]
struct StageArgs {
    /// Directory holding `{caseID}_{index:04}` channel files
    #[arg(long)]
    case_dir: PathBuf,
    #[arg(long)]
    case_id: String,
    /// Channels to expose, in the consumer's order
    #[arg(long, value_delimiter = ',', required = true)]
    channels: Vec<String>,
    #[arg(long)]
    dest: PathBuf,
    #[arg(long, value_enum)]
    copy_mode: Option<CopyMode>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().ok().map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "segfusion=info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = match config {
        Ok(config) => run(cli.command, config).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "segfusion failed");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(command: Command, mut config: Config) -> Result<(), Error> {
    match command {
        Command::RunPipeline(args) => {
            if let Some(root) = args.output_root {
                config.output_root = root;
            }
            if let Some(root) = args.scratch_root {
                config.scratch_root = root;
            }
            let case_id = CaseId::new(args.case_id)?;
            let report = Pipeline::new(config, case_id, &args.ct, &args.pet)
                .force(args.force)
                .run()
                .await?;
            info!(skipped = ?report.skipped, branch = ?report.fusion.branch, "Run complete");
            println!("{}", report.final_path.display());
        }
        Command::Fuse(args) => {
            let options = args.options(&config);
            fuse_files(&args.base, &args.overlay, &args.out, &options)?;
        }
        Command::Stage(args) => {
            let case_id = CaseId::new(args.case_id)?;
            let stager = Stager::new(config.channels, args.copy_mode.unwrap_or(config.copy_mode));
            let view = stager.stage(&args.case_dir, &case_id, &args.channels, &args.dest)?;
            for file in view.files {
                println!("{}", file.display());
            }
        }
    }
    Ok(())
}
