use handoff_core::model::CaptureStatusReport;
use handoff_core::state::CaptureRuntime;
use handoff_pipeline::PipelineDashboard;

use super::OutputFormat;

pub fn format_capture_status(
    report: &CaptureStatusReport,
    runtime: Option<&CaptureRuntime>,
    fmt: OutputFormat,
) -> String {
    match fmt {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "status": report.status,
                "monitoring": report.monitoring,
                "watched_files": report.watched_files,
                "handlers": report.handlers,
                "strategy": report.strategy,
                "pid": runtime.map(|r| r.pid),
                "started_at": runtime.map(|r| r.started_at),
                "updated_at": runtime.map(|r| r.updated_at),
            });
            serde_json::to_string_pretty(&value).unwrap_or_default()
        }
        OutputFormat::Text => format_capture_status_text(report, runtime),
    }
}

fn format_capture_status_text(report: &CaptureStatusReport, runtime: Option<&CaptureRuntime>) -> String {
    let mut out = String::new();
    out.push_str(&format!("Status:        {}\n", report.status));
    out.push_str(&format!(
        "Monitoring:    {}\n",
        if report.monitoring { "yes" } else { "no" }
    ));
    out.push_str(&format!("Strategy:      {}\n", report.strategy));
    out.push_str(&format!("Watched files: {}\n", report.watched_files));
    out.push_str(&format!("Handlers:      {}", report.handlers));
    if let Some(r) = runtime {
        out.push_str(&format!("\nPid:           {}", r.pid));
        out.push_str(&format!(
            "\nStarted:       {}",
            r.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str(&format!(
            "\nLast update:   {}",
            r.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    out
}

pub fn format_dashboard(dashboard: &PipelineDashboard, fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => serde_json::to_string_pretty(dashboard).unwrap_or_default(),
        OutputFormat::Text => {
            if dashboard.agents.is_empty() {
                return "No pipeline agents configured.".to_string();
            }
            dashboard.render_text().trim_end().to_string()
        }
    }
}
