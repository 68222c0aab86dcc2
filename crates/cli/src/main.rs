mod commands;
mod config;
mod context;
mod serve;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use hatch_core::{Application, ParseEnumError, PublishStatus, Status};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::HatchConfig;
use crate::context::Context;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Hatch experiment publisher.
#[derive(Parser)]
#[command(name = "hatch", version, about = "Hatch experiment publisher")]
struct Cli {
    /// Path to hatch.toml (default: ./hatch.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the admin API
    Serve {
        /// Port to listen on (overrides config and HATCH_PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run one publish and one liveness pass, then exit
    Tick {
        /// Only this application (default: all configured)
        #[arg(long, value_parser = parse_application)]
        application: Option<Application>,
    },

    /// Create a DRAFT experiment
    Create {
        slug: String,
        #[arg(long, value_parser = parse_application)]
        application: Application,
        /// Percentage of the population to enroll, 0 to 100
        #[arg(long)]
        population: f64,
        /// Isolation group name (default: the slug)
        #[arg(long)]
        isolation_group: Option<String>,
        /// JSON file with the published payload (name, branches, targeting, ...)
        #[arg(long)]
        payload: Option<PathBuf>,
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Request a lifecycle change
    Transition {
        slug: String,
        #[arg(long, value_parser = parse_status)]
        status: Option<Status>,
        #[arg(long, value_parser = parse_status)]
        status_next: Option<Status>,
        #[arg(long, value_parser = parse_publish_status)]
        publish_status: Option<PublishStatus>,
        /// Queue for review towards this status (shorthand for
        /// --status-next <STATUS> --publish-status REVIEW)
        #[arg(long, value_parser = parse_status, conflicts_with_all = ["status_next", "publish_status"])]
        request_review: Option<Status>,
        #[arg(long)]
        message: Option<String>,
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Show an experiment record
    Show { slug: String },

    /// Show an experiment's change history
    History { slug: String },
}

fn parse_application(s: &str) -> Result<Application, ParseEnumError> {
    s.to_ascii_lowercase().replace('-', "_").parse()
}

fn parse_status(s: &str) -> Result<Status, ParseEnumError> {
    s.to_ascii_uppercase().parse()
}

fn parse_publish_status(s: &str) -> Result<PublishStatus, ParseEnumError> {
    s.to_ascii_uppercase().parse()
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .try_init();
}

fn main() {
    let Cli {
        config,
        output,
        quiet,
        command,
    } = Cli::parse();
    init_tracing(quiet);

    let config = match HatchConfig::load(config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            report_error(&e.to_string(), output, quiet);
            process::exit(2);
        }
    };
    let ctx = match Context::new(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            report_error(&e.to_string(), output, quiet);
            process::exit(2);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to start runtime: {e}"), output, quiet);
            process::exit(1);
        }
    };

    let result = rt.block_on(async {
        match command {
            Commands::Serve { port } => {
                let port = port.unwrap_or_else(|| ctx.config.port());
                serve::start_server(ctx, port).await
            }
            Commands::Tick { application } => commands::tick::cmd_tick(&ctx, application, output).await,
            Commands::Create {
                slug,
                application,
                population,
                isolation_group,
                payload,
                actor,
            } => {
                commands::experiment::cmd_create(
                    &ctx,
                    commands::experiment::CreateArgs {
                        slug,
                        application,
                        population,
                        isolation_group,
                        payload,
                        actor,
                    },
                    output,
                )
                .await
            }
            Commands::Transition {
                slug,
                status,
                status_next,
                publish_status,
                request_review,
                message,
                actor,
            } => {
                let request = match request_review {
                    Some(target) => {
                        let mut request = hatch_engine::TransitionRequest::request_review(target);
                        request.status = status;
                        request
                    }
                    None => hatch_engine::TransitionRequest {
                        status,
                        status_next,
                        publish_status,
                    },
                };
                commands::experiment::cmd_transition(&ctx, &slug, request, &actor, message, output)
                    .await
            }
            Commands::Show { slug } => commands::experiment::cmd_show(&ctx, &slug, output).await,
            Commands::History { slug } => {
                commands::experiment::cmd_history(&ctx, &slug, output).await
            }
        }
    });

    if let Err(e) = result {
        report_error(&e.to_string(), output, quiet);
        process::exit(1);
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("error: {}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
