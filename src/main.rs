//! # Agentation CLI (`agentation`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `agentation serve` | Start the annotation API (and tunnel, if configured) |
//! | `agentation tag <paths>` | Tag JSX elements with their source location |
//! | `agentation annotations list` | Print stored annotations |
//! | `agentation annotations add` | Store a new annotation |
//! | `agentation annotations update <id>` | Change an annotation's comment or location |
//! | `agentation annotations remove <id>` | Delete an annotation |
//!
//! ## Examples
//!
//! ```bash
//! # Serve the API with the defaults (127.0.0.1:5173, ./annotations.json)
//! agentation serve
//!
//! # Print one tagged file
//! agentation tag src/App.tsx
//!
//! # Tag a whole tree with source maps
//! agentation tag src --out-dir .agentation/src --source-map
//!
//! # Talk to a running server
//! agentation annotations add --location src/App.tsx:10:2 --comment "fix spacing"
//! ```

use std::path::PathBuf;

use agentation::client::SyncClient;
use agentation::config::{self, Config};
use agentation::locator::BuildMode;
use agentation::models::{AnnotationFields, AnnotationPatch};
use agentation::tag::{self, TagOptions};
use agentation::server;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG: &str = "./agentation.toml";

/// Agentation: tag JSX with source locations and store visual annotations.
#[derive(Parser)]
#[command(name = "agentation", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./agentation.toml`; built-in defaults apply when that
    /// file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the annotation API server.
    ///
    /// Opens a public tunnel as well when a tunnel credential is configured
    /// (`[tunnel].authtoken` or `NGROK_AUTHTOKEN`).
    Serve,

    /// Tag JSX elements with `data-agentation-location`.
    ///
    /// A single file is printed to stdout; directories need `--out-dir`.
    Tag {
        /// Files or directories to process.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Mirror the inputs into this directory.
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Write `<file>.map` next to each tagged file.
        #[arg(long)]
        source_map: bool,

        /// `serve` tags; `build` passes files through untouched.
        #[arg(long, value_enum, default_value = "serve")]
        mode: ModeArg,
    },

    /// Work with the annotations of a running server.
    Annotations {
        /// Dev server origin used for discovery. Defaults to the configured bind address.
        #[arg(long, global = true)]
        server: Option<String>,

        #[command(subcommand)]
        action: AnnotationAction,
    },
}

#[derive(Subcommand)]
enum AnnotationAction {
    /// Print all annotations as JSON.
    List,
    /// Store a new annotation.
    Add {
        /// Marker value, e.g. `src/App.tsx:10:2`.
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        comment: Option<String>,
        /// Element descriptor, e.g. `button`.
        #[arg(long)]
        element: Option<String>,
        /// Explicit id; generated by the server when omitted.
        #[arg(long)]
        id: Option<String>,
    },
    /// Change the comment and/or location of an annotation.
    Update {
        id: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Delete an annotation.
    Remove { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Serve,
    Build,
}

impl From<ModeArg> for BuildMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Serve => BuildMode::Serve,
            ModeArg::Build => BuildMode::Build,
        }
    }
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Logs go to stderr so `agentation tag` can stream code on stdout.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_bool("AGENTATION_LOG_JSON") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load(cli_config: Option<&PathBuf>) -> anyhow::Result<Config> {
    match cli_config {
        Some(path) => config::load_config(path),
        None => config::load_config_or_default(DEFAULT_CONFIG.as_ref()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Tag {
            paths,
            out_dir,
            source_map,
            mode,
        } => {
            tag::run_tag(
                &cfg,
                &TagOptions {
                    paths,
                    out_dir,
                    source_map,
                    mode: mode.into(),
                },
            )?;
        }
        Commands::Annotations { server, action } => {
            let origin = server.unwrap_or_else(|| {
                format!("http://localhost:{}", cfg.server.port().unwrap_or(5173))
            });
            let client = SyncClient::new(origin, cfg.server.prefix.clone());
            run_annotation_action(&client, action).await?;
        }
    }

    Ok(())
}

async fn run_annotation_action(client: &SyncClient, action: AnnotationAction) -> anyhow::Result<()> {
    match action {
        AnnotationAction::List => {
            let records = client.list().await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        AnnotationAction::Add {
            location,
            comment,
            element,
            id,
        } => {
            let fields = AnnotationFields {
                source_location: location,
                comment,
                element: element.map(serde_json::Value::String),
            };
            let stored = client.create(id.as_deref(), &fields).await?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        AnnotationAction::Update {
            id,
            location,
            comment,
        } => {
            let patch = AnnotationPatch {
                source_location: location,
                comment,
            };
            if patch.is_empty() {
                anyhow::bail!("nothing to update: pass --comment and/or --location");
            }
            let updated = client.update(&id, &patch).await?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }
        AnnotationAction::Remove { id } => {
            client.delete(&id).await?;
            println!("removed {}", id);
        }
    }
    Ok(())
}
