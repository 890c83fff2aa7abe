//! Convoy agent CLI
//!
//! Usage:
//!   convoy-agent start                     Register and poll for jobs
//!   convoy-agent artifact upload <glob>    Upload artifacts for the current job
//!   convoy-agent artifact download <glob>  Download artifacts from the build
//!   convoy-agent artifact shasum <path>    Print one artifact's checksum
//!   convoy-agent meta-data set <key> <val> Set build metadata
//!   convoy-agent meta-data get <key>       Get build metadata
//!
//! Every flag also sources a `CONVOY_*` environment variable, so the
//! artifact and meta-data subcommands work unmodified inside a job's
//! bootstrap environment.

use clap::{Args, Parser, Subcommand};
use convoy_api::{register, ApiClient, MetadataStore};
use convoy_artifact::{download, shasum, upload, BucketClient, BucketDestination, UploadScope};
use convoy_core::{
    AgentConfig, AgentError, BucketConfig, Result, SearchQuery, DEFAULT_ENDPOINT,
};
use convoy_runner::{JobPoller, OutputChunk};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "convoy-agent")]
#[command(author, version, about = "Build agent for the Convoy coordination service")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true, env = "CONVOY_AGENT_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with the coordination service and poll for jobs
    Start(StartArgs),

    /// Exchange build artifacts
    Artifact {
        #[command(subcommand)]
        action: ArtifactCommands,
    },

    /// Build-scoped key/value metadata
    #[command(name = "meta-data")]
    MetaData {
        #[command(subcommand)]
        action: MetaDataCommands,
    },
}

#[derive(Args)]
struct StartArgs {
    /// Account agent token used to register
    #[arg(long, env = "CONVOY_AGENT_TOKEN")]
    token: String,

    /// Agent name (defaults to the hostname)
    #[arg(long, env = "CONVOY_AGENT_NAME")]
    name: Option<String>,

    /// Scheduling priority; higher priorities are assigned work first
    #[arg(long, env = "CONVOY_AGENT_PRIORITY")]
    priority: Option<String>,

    /// Meta-data tags as key=value pairs
    #[arg(long = "meta-data", env = "CONVOY_AGENT_META_DATA", value_delimiter = ',')]
    meta_data: Vec<String>,

    /// Path to the bootstrap script each job runs
    #[arg(
        long,
        env = "CONVOY_BOOTSTRAP_SCRIPT_PATH",
        default_value = "./bootstrap.sh"
    )]
    bootstrap_script: PathBuf,

    /// Directory builds run from
    #[arg(long, env = "CONVOY_BUILD_PATH", default_value = "./builds")]
    build_path: PathBuf,

    /// Directory hook scripts are found in
    #[arg(long, env = "CONVOY_HOOKS_PATH")]
    hooks_path: Option<PathBuf>,

    /// Run jobs through pipes instead of a pseudo terminal
    #[arg(long, env = "CONVOY_NO_PTY")]
    no_pty: bool,

    /// Refuse job-supplied commands; run only the fixed bootstrap script
    #[arg(long, env = "CONVOY_NO_COMMAND_EVAL")]
    no_command_eval: bool,

    /// Coordination service base URL
    #[arg(long, env = "CONVOY_AGENT_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
}

/// Connection flags shared by the in-job subcommands. The bootstrap
/// environment provides all of these.
#[derive(Args)]
struct ConnectionArgs {
    /// Per-agent access token issued at registration
    #[arg(long = "agent-access-token", env = "CONVOY_AGENT_ACCESS_TOKEN")]
    access_token: String,

    /// Coordination service base URL
    #[arg(long, env = "CONVOY_AGENT_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// Upload files matching a glob pattern as artifacts of the current job
    Upload {
        /// Glob pattern, expanded relative to the working directory
        pattern: String,

        /// Optional s3://bucket/prefix destination for direct upload
        destination: Option<String>,

        /// Job the artifacts belong to
        #[arg(long, env = "CONVOY_JOB_ID")]
        job: String,

        /// Build the job belongs to
        #[arg(long, env = "CONVOY_BUILD_ID")]
        build: String,

        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Download every artifact in the build matching a pattern
    Download {
        /// Pattern matched against recorded artifact paths, service-side
        pattern: String,

        /// Directory to download into
        #[arg(default_value = ".")]
        destination: PathBuf,

        /// Build to search within
        #[arg(long, env = "CONVOY_BUILD_ID")]
        build: String,

        /// Restrict the search to one step by name or job ID
        #[arg(long)]
        step: Option<String>,

        /// Restrict the search to one exact job
        #[arg(long)]
        job: Option<String>,

        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Print the checksum of exactly one artifact
    Shasum {
        /// Pattern that must resolve to a single artifact
        pattern: String,

        /// Build to search within
        #[arg(long, env = "CONVOY_BUILD_ID")]
        build: String,

        /// Restrict the search to one step by name or job ID
        #[arg(long)]
        step: Option<String>,

        /// Restrict the search to one exact job
        #[arg(long)]
        job: Option<String>,

        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[derive(Subcommand)]
enum MetaDataCommands {
    /// Set a key to a value on the build
    Set {
        key: String,
        value: String,

        /// Build the metadata belongs to
        #[arg(long, env = "CONVOY_BUILD_ID")]
        build: String,

        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Print the value of a key on the build
    Get {
        key: String,

        /// Build the metadata belongs to
        #[arg(long, env = "CONVOY_BUILD_ID")]
        build: String,

        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install log subscriber");
    }

    let result = match cli.command {
        Commands::Start(args) => cmd_start(args).await,
        Commands::Artifact { action } => cmd_artifact(action).await,
        Commands::MetaData { action } => cmd_meta_data(action).await,
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn cmd_start(args: StartArgs) -> Result<()> {
    let name = match args.name {
        Some(name) => name,
        None => hostname(),
    };

    let mut config = AgentConfig::new(&args.token, name, args.bootstrap_script, args.build_path)
        .with_endpoint(&args.endpoint)
        .with_pty(!args.no_pty)
        .with_command_eval(!args.no_command_eval);
    config.hooks_path = args.hooks_path;
    if let Some(priority) = args.priority {
        config = config.with_priority(priority);
    }
    if !args.meta_data.is_empty() {
        config = config.with_meta_data(args.meta_data);
    }
    if let Some(bucket) = bucket_config_from_env() {
        config = config.with_bucket(bucket);
    }

    // register with the account token, then talk with the issued one
    let registration_client = ApiClient::new(&args.endpoint, &args.token)?;
    let identity = register(&registration_client, &config).await?;
    let client = ApiClient::new(&args.endpoint, &identity.access_token)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing in-flight work (interrupt again to force)");
            let _ = shutdown_tx.send(true);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Forced shutdown, abandoning in-flight work");
            std::process::exit(1);
        }
    });

    let (log_tx, log_rx) = mpsc::channel::<OutputChunk>(256);
    tokio::spawn(pump_job_output(log_rx));

    JobPoller::new(client, config, identity).run(shutdown_rx, log_tx).await
}

/// Stream job output chunks to our own stdout, in arrival order.
async fn pump_job_output(mut log_rx: mpsc::Receiver<OutputChunk>) {
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = log_rx.recv().await {
        if stdout.write_all(&chunk.bytes).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
}

async fn cmd_artifact(action: ArtifactCommands) -> Result<()> {
    match action {
        ArtifactCommands::Upload {
            pattern,
            destination,
            job,
            build,
            connection,
        } => {
            let client = ApiClient::new(&connection.endpoint, &connection.access_token)?;
            let bucket = match destination.as_deref() {
                Some(dest) if BucketDestination::is_bucket_url(dest) => {
                    match bucket_config_from_env() {
                        Some(config) => Some(BucketClient::new(config)?),
                        None => {
                            return Err(AgentError::Auth(
                                "bucket destination given but no CONVOY_S3_* credentials set"
                                    .to_string(),
                            ))
                        }
                    }
                }
                _ => None,
            };
            let working_dir = std::env::current_dir()?;
            let scope = UploadScope {
                build_id: build,
                job_id: job,
            };

            let (records, session) = upload(
                &client,
                bucket.as_ref(),
                &working_dir,
                &pattern,
                destination.as_deref(),
                &scope,
            )
            .await?;

            for record in &records {
                tracing::info!("Uploaded {} ({} bytes)", record.path, record.file_size);
            }
            for (path, reason) in &session.failed {
                tracing::error!("Failed to upload {}: {}", path, reason);
            }
            if !session.is_success() {
                return Err(AgentError::Transient(format!(
                    "{} of {} artifact(s) failed to upload",
                    session.failed.len(),
                    session.files.len()
                )));
            }
            Ok(())
        }

        ArtifactCommands::Download {
            pattern,
            destination,
            build,
            step,
            job,
            connection,
        } => {
            let client = ApiClient::new(&connection.endpoint, &connection.access_token)?;
            let query = build_query(pattern, build, step, job);

            let (paths, session) = download(&client, &query, &destination).await?;

            for path in &paths {
                tracing::info!("Downloaded {}", path.display());
            }
            for (path, reason) in &session.failed {
                tracing::error!("Failed to download {}: {}", path, reason);
            }
            if !session.is_success() {
                return Err(AgentError::Transient(format!(
                    "{} of {} artifact(s) failed to download",
                    session.failed.len(),
                    session.files.len()
                )));
            }
            Ok(())
        }

        ArtifactCommands::Shasum {
            pattern,
            build,
            step,
            job,
            connection,
        } => {
            let client = ApiClient::new(&connection.endpoint, &connection.access_token)?;
            let query = build_query(pattern, build, step, job);
            let digest = shasum(&client, &query).await?;
            // bare digest on stdout, for scripting
            println!("{}", digest);
            Ok(())
        }
    }
}

async fn cmd_meta_data(action: MetaDataCommands) -> Result<()> {
    match action {
        MetaDataCommands::Set {
            key,
            value,
            build,
            connection,
        } => {
            let client = ApiClient::new(&connection.endpoint, &connection.access_token)?;
            MetadataStore::new(&client).set(&build, &key, &value).await
        }
        MetaDataCommands::Get {
            key,
            build,
            connection,
        } => {
            let client = ApiClient::new(&connection.endpoint, &connection.access_token)?;
            let entry = MetadataStore::new(&client).get(&build, &key).await?;
            println!("{}", entry.value);
            Ok(())
        }
    }
}

fn build_query(
    pattern: String,
    build: String,
    step: Option<String>,
    job: Option<String>,
) -> SearchQuery {
    let mut query = SearchQuery::new(pattern).with_build(build);
    if let Some(step) = step {
        query = query.with_step(step);
    }
    if let Some(job) = job {
        query = query.with_job(job);
    }
    query
}

/// Direct-upload credentials come from the environment only, never flags,
/// so secrets stay out of process listings.
fn bucket_config_from_env() -> Option<BucketConfig> {
    let access_key_id = std::env::var("CONVOY_S3_ACCESS_KEY_ID").ok()?;
    let secret_access_key = std::env::var("CONVOY_S3_SECRET_ACCESS_KEY").ok()?;

    let mut config = BucketConfig::new(access_key_id, secret_access_key);
    if let Ok(region) = std::env::var("CONVOY_S3_DEFAULT_REGION") {
        config = config.with_region(region);
    }
    if let Ok(acl) = std::env::var("CONVOY_S3_ACL") {
        config = config.with_acl(acl);
    }
    Some(config)
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "convoy-agent".to_string())
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "convoy-agent".to_string())
}
