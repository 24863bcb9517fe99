mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kiln_build::BuildError;
use kiln_core::exit;
use kiln_launch::LaunchError;

#[derive(Parser)]
#[command(name = "kiln", about = "Build container images and launch their server locally")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a kiln.toml into the current project
    Init,
    /// Build an image from the current project
    Build {
        /// Tag for the image (default: [image].name or the directory name)
        #[arg(long, short = 't')]
        tag: Option<String>,
    },
    /// Launch the server of a built image
    Launch {
        /// Image tag or id (default: the project's image name)
        image: Option<String>,
    },
    /// Render the build recipe as a Dockerfile
    Dockerfile {
        /// Write ./Dockerfile instead of printing to stdout
        #[arg(long)]
        write: bool,
        /// Overwrite an existing Dockerfile
        #[arg(long, requires = "write")]
        force: bool,
    },
    /// List images in the local store
    Images {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the configuration of an image
    Inspect {
        /// Image tag or id
        image: String,
    },
    /// Check engine, installer and server setup
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(command: Commands) -> anyhow::Result<u8> {
    match command {
        Commands::Init => commands::init_project()?,
        Commands::Build { tag } => commands::build(tag.as_deref()).await?,
        Commands::Launch { image } => return commands::launch(image.as_deref()).await,
        Commands::Dockerfile { write, force } => commands::dockerfile(write, force)?,
        Commands::Images { json } => commands::images(json)?,
        Commands::Inspect { image } => commands::inspect(&image)?,
        Commands::Doctor => commands::doctor().await?,
    }
    Ok(exit::SUCCESS)
}

fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(e) = error.downcast_ref::<BuildError>() {
        e.exit_code()
    } else if let Some(e) = error.downcast_ref::<LaunchError>() {
        e.exit_code()
    } else {
        exit::FAILURE
    }
}
