use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use logeval_core::Harness;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "logeval")]
#[command(about = "Log anomaly detection evaluation harness", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[arg(long, short, global = true, help = "Show verbose debug output")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show configuration, paths and configured datasets")]
    Info,

    #[command(about = "Convert a row-oriented HDFS export into a flat log and block labels")]
    Convert {
        #[arg(
            long,
            help = "Exported rows (.jsonl/.csv file or directory); overrides [conversion].input"
        )]
        input: Option<PathBuf>,

        #[arg(long, help = "Output directory; overrides [conversion].output_dir")]
        output_dir: Option<PathBuf>,
    },

    #[command(about = "Group a flat log into sessions and write train.csv / test.csv")]
    Prepare {
        #[arg(help = "Dataset name (uses first configured dataset if omitted)")]
        dataset: Option<String>,
    },

    #[command(about = "Evaluate one dataset against the model endpoint")]
    Eval {
        #[arg(help = "Dataset name")]
        dataset: String,
    },

    #[command(about = "Evaluate every configured dataset and print a summary")]
    EvalAll {
        #[arg(long, short, help = "Also write the summary as JSON to this file")]
        output: Option<PathBuf>,
    },

    #[command(about = "Upload dataset files to object storage")]
    Upload,

    #[command(about = "Download dataset files from object storage")]
    Download,

    #[command(about = "Check that encoder, decoder and adapter weights exist")]
    CheckModels {
        #[arg(long, help = "Also run a short generation against the model endpoint")]
        generate: bool,
    },

    #[command(about = "Check model hub token, connectivity and authentication")]
    HubCheck,

    #[command(about = "Download the HDFS dataset repo from the model hub")]
    DownloadHdfs {
        #[arg(long, help = "Destination directory; overrides [conversion].input")]
        output: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy(),
        )
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let harness = Harness::load("logeval")?;

    match cli.command {
        Commands::Info => commands::handle_info(&harness)?,
        Commands::Convert { input, output_dir } => {
            commands::handle_convert(&harness, input.as_deref(), output_dir.as_deref())?;
        }
        Commands::Prepare { dataset } => {
            commands::handle_prepare(&harness, dataset.as_deref())?;
        }
        Commands::Eval { dataset } => commands::handle_eval(&harness, &dataset).await?,
        Commands::EvalAll { output } => {
            commands::handle_eval_all(&harness, output.as_deref()).await?;
        }
        Commands::Upload => commands::handle_upload(&harness)?,
        Commands::Download => commands::handle_download(&harness)?,
        Commands::CheckModels { generate } => {
            commands::handle_check_models(&harness, generate).await?;
        }
        Commands::HubCheck => commands::handle_hub_check(&harness).await?,
        Commands::DownloadHdfs { output } => {
            commands::handle_download_hdfs(&harness, output.as_deref()).await?;
        }
    }

    Ok(())
}
