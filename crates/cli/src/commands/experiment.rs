use std::path::{Path, PathBuf};

use hatch_core::{Application, ChangeLogEntry, ExperimentPayload, ExperimentRecord};
use hatch_engine::{CreateExperiment, TransitionRequest};
use hatch_storage::HatchStorage;
use time::format_description::well_known::Rfc3339;

use super::{emit, CmdResult};
use crate::context::Context;
use crate::OutputFormat;

pub(crate) struct CreateArgs {
    pub(crate) slug: String,
    pub(crate) application: Application,
    pub(crate) population: f64,
    pub(crate) isolation_group: Option<String>,
    pub(crate) payload: Option<PathBuf>,
    pub(crate) actor: String,
}

fn read_payload(path: &Path) -> Result<ExperimentPayload, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("could not parse '{}': {}", path.display(), e))
}

pub(crate) async fn cmd_create(ctx: &Context, args: CreateArgs, output: OutputFormat) -> CmdResult {
    let payload = match &args.payload {
        Some(path) => read_payload(path)?,
        None => ExperimentPayload::default(),
    };
    let record = ctx
        .mutations
        .create(
            CreateExperiment {
                slug: args.slug,
                application: args.application,
                population_fraction: args.population,
                isolation_group: args.isolation_group,
                payload,
            },
            &args.actor,
        )
        .await?;
    emit(output, &record, || format!("created {}\n{}", record.slug, render_record(&record)))
}

pub(crate) async fn cmd_transition(
    ctx: &Context,
    slug: &str,
    request: TransitionRequest,
    actor: &str,
    message: Option<String>,
    output: OutputFormat,
) -> CmdResult {
    let record = ctx
        .mutations
        .request_transition(slug, &request, actor, message)
        .await?;
    emit(output, &record, || render_record(&record))
}

pub(crate) async fn cmd_show(ctx: &Context, slug: &str, output: OutputFormat) -> CmdResult {
    let record = ctx.storage.get_experiment(slug).await?;
    emit(output, &record, || render_record(&record))
}

pub(crate) async fn cmd_history(ctx: &Context, slug: &str, output: OutputFormat) -> CmdResult {
    // Surface an unknown slug as such rather than as an empty history.
    ctx.storage.get_experiment(slug).await?;
    let history = ctx.storage.list_changelog(slug).await?;
    emit(output, &history, || {
        history.iter().map(render_entry).collect::<Vec<_>>().join("\n")
    })
}

fn render_record(record: &ExperimentRecord) -> String {
    let next = record
        .status_next
        .map_or_else(|| "-".to_string(), |s| s.to_string());
    format!(
        "slug:            {}\n\
         application:     {}\n\
         status:          {}\n\
         status_next:     {}\n\
         publish_status:  {}\n\
         population:      {}%\n\
         isolation_group: {}\n\
         version:         {}",
        record.slug,
        record.application,
        record.status,
        next,
        record.publish_status,
        record.population_fraction,
        record.isolation_group_name(),
        record.version,
    )
}

fn render_entry(entry: &ChangeLogEntry) -> String {
    let timestamp = entry
        .timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| entry.timestamp.to_string());
    let old = match (entry.old_status, entry.old_publish_status) {
        (Some(status), Some(publish)) => format!("{status}/{publish}"),
        _ => "(created)".to_string(),
    };
    let mut line = format!(
        "#{:<4} {}  {} -> {}/{}  by {}",
        entry.id, timestamp, old, entry.new_status, entry.new_publish_status, entry.actor
    );
    if let Some(message) = &entry.message {
        line.push_str(&format!(": {message}"));
    }
    line
}
