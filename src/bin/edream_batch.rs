use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use edream_batch::app::{App, ProgressSink, RunOptions, RunReport};
use edream_batch::client::HttpJobStore;
use edream_batch::clock::SystemClock;
use edream_batch::config::{
    ConfigLoader, I2V_CONFIG_FILE, IMAGE_CONFIG_FILE, PollOverrides, UPREZ_CONFIG_FILE,
    client_config_from_env,
};
use edream_batch::error::BatchError;
use edream_batch::output::{ConsoleOutput, JsonOutput, OutputMode};

#[derive(Parser)]
#[command(name = "edream-batch")]
#[command(about = "Idempotent batch submission of generation jobs to a remote media service")]
#[command(version, author)]
struct Cli {
    /// Print the run report as JSON on stdout instead of progress lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Animate every image in a directory with each prompt combo")]
    I2v(RunArgs),
    #[command(about = "Generate images from a prompt and download them")]
    Image(RunArgs),
    #[command(about = "Upscale every video of a source playlist")]
    Uprez(RunArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Config file; defaults to the workflow's file in the working directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds between status checks.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Seconds after which polling gives up on pending jobs.
    #[arg(long)]
    deadline: Option<u64>,

    /// Plan the batch without creating anything remotely.
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn config_path(&self, default_file: &str) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(default_file))
    }

    fn overrides(&self) -> PollOverrides {
        PollOverrides {
            interval: self.poll_interval.map(Duration::from_secs),
            deadline: self.deadline.map(Duration::from_secs),
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<BatchError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BatchError) -> u8 {
    if error.is_config() {
        return 2;
    }
    match error {
        BatchError::Http(_) | BatchError::Status { .. } | BatchError::Decode(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Console
    };
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Console => &ConsoleOutput,
    };

    let report = match &cli.command {
        Commands::I2v(args) => {
            let mut config = ConfigLoader::image_to_video(&args.config_path(I2V_CONFIG_FILE))?;
            config.poll = args.overrides().apply(config.poll)?;
            build_app(args)?.image_to_video(&config, sink)?
        }
        Commands::Image(args) => {
            let mut config =
                ConfigLoader::image_generation(&args.config_path(IMAGE_CONFIG_FILE))?;
            config.poll = args.overrides().apply(config.poll)?;
            build_app(args)?.image_generation(&config, sink)?
        }
        Commands::Uprez(args) => {
            let mut config = ConfigLoader::uprez(&args.config_path(UPREZ_CONFIG_FILE))?;
            config.poll = args.overrides().apply(config.poll)?;
            build_app(args)?.uprez(&config, sink)?
        }
    };

    print_report(&report, output_mode)
}

fn build_app(args: &RunArgs) -> Result<App<HttpJobStore, SystemClock>, BatchError> {
    let client_config = client_config_from_env()?;
    tracing::debug!(base_url = %client_config.base_url, "using backend");
    let store = HttpJobStore::new(&client_config)?;
    Ok(App::new(store, SystemClock).with_options(RunOptions {
        dry_run: args.dry_run,
        ..RunOptions::default()
    }))
}

fn print_report(report: &RunReport, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_report(report)
            .map_err(|err| BatchError::Filesystem(err.to_string()))?,
        OutputMode::Console => ConsoleOutput::print_summary(report),
    }
    Ok(())
}
