use hatch_core::Application;
use hatch_engine::{LivenessReport, ReconcileReport, TickReport};

use super::{emit, CmdResult};
use crate::context::Context;
use crate::OutputFormat;

pub(crate) async fn cmd_tick(
    ctx: &Context,
    application: Option<Application>,
    output: OutputFormat,
) -> CmdResult {
    let reports: Vec<TickReport> = match application {
        Some(application) => {
            ctx.broker.application(application)?;
            let publish = ctx
                .broker
                .reconcile(application)
                .await
                .map_err(|e| e.to_string());
            let liveness = ctx
                .liveness
                .reconcile_liveness(application)
                .await
                .map_err(|e| e.to_string());
            vec![TickReport {
                application,
                publish,
                liveness,
            }]
        }
        None => ctx.scheduler().run_once().await,
    };

    emit(output, &reports, || {
        reports.iter().map(render_tick).collect::<Vec<_>>().join("\n")
    })?;

    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    if failed > 0 {
        return Err(format!("{failed} of {} application tick(s) failed", reports.len()).into());
    }
    Ok(())
}

fn render_tick(report: &TickReport) -> String {
    let publish = match &report.publish {
        Ok(publish) => render_publish(publish),
        Err(e) => format!("publish failed: {e}"),
    };
    let liveness = match &report.liveness {
        Ok(liveness) => render_liveness(liveness),
        Err(e) => format!("liveness failed: {e}"),
    };
    format!("{}: {}; {}", report.application, publish, liveness)
}

fn render_publish(report: &ReconcileReport) -> String {
    let mut parts = Vec::new();
    if let Some(slug) = &report.rolled_back {
        parts.push(format!("rolled back {slug}"));
    }
    if report.blocked {
        parts.push("review pending".to_string());
    }
    if let Some(pushed) = &report.pushed {
        parts.push(format!(
            "pushed {} towards {} ({})",
            pushed.slug, pushed.status_next, pushed.publish_status
        ));
    }
    parts.push(format!("{} queued", report.queued.len()));
    parts.join(", ")
}

fn render_liveness(report: &LivenessReport) -> String {
    if report.went_live.is_empty() && report.completed.is_empty() {
        return "no status changes".to_string();
    }
    let mut parts = Vec::new();
    if !report.went_live.is_empty() {
        parts.push(format!("live: {}", report.went_live.join(" ")));
    }
    if !report.completed.is_empty() {
        parts.push(format!("complete: {}", report.completed.join(" ")));
    }
    parts.join(", ")
}
