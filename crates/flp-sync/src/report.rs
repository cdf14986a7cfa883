use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flp_storage::PipelineStats;
use tokio::fs;

use crate::orchestrator::{CampaignRunReport, RunState};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const DAILY_BRIEF_FILE: &str = "daily_brief.md";

/// Write `reports/<run_id>/run_summary.json` and `daily_brief.md`; returns the run directory.
pub async fn write_run_reports(
    workspace_root: &Path,
    report: &CampaignRunReport,
    stats: Option<&PipelineStats>,
) -> Result<PathBuf> {
    let reports_dir = workspace_root.join("reports").join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary = serde_json::to_vec_pretty(&serde_json::json!({
        "run": report,
        "pipeline_stats": stats,
    }))
    .context("serializing run summary")?;
    fs::write(reports_dir.join(RUN_SUMMARY_FILE), summary)
        .await
        .with_context(|| format!("writing {RUN_SUMMARY_FILE}"))?;

    fs::write(reports_dir.join(DAILY_BRIEF_FILE), daily_brief(report, stats))
        .await
        .with_context(|| format!("writing {DAILY_BRIEF_FILE}"))?;

    Ok(reports_dir)
}

/// Load the run recorded under `reports/<run_id>/run_summary.json`.
pub async fn read_run_report(workspace_root: &Path, run_id: &str) -> Result<CampaignRunReport> {
    let summary_path = workspace_root.join("reports").join(run_id).join(RUN_SUMMARY_FILE);
    let raw = fs::read_to_string(&summary_path)
        .await
        .with_context(|| format!("reading {}", summary_path.display()))?;
    let mut summary: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", summary_path.display()))?;
    let run = summary
        .get_mut("run")
        .map(serde_json::Value::take)
        .with_context(|| format!("{} has no run section", summary_path.display()))?;
    serde_json::from_value(run).with_context(|| format!("decoding run in {}", summary_path.display()))
}

fn state_label(state: &RunState) -> &'static str {
    match state {
        RunState::Idle => "idle",
        RunState::Running { .. } => "running",
        RunState::Completed => "completed",
        RunState::Failed => "failed",
    }
}

pub fn daily_brief(report: &CampaignRunReport, stats: Option<&PipelineStats>) -> String {
    let mut lines = vec![
        "# Lead Pipeline Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Mode: {}", report.mode),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!(
            "- State: {}{}",
            state_label(&report.state),
            if report.cancelled { " (cancelled)" } else { "" }
        ),
        format!("- Tracker: {}", report.tracker),
        format!("- Discovered: {}", report.discovered),
        format!("- New leads: {}", report.created),
        format!("- Updated leads: {} ({} with a better score)", report.merged, report.score_improved),
    ];
    if report.degraded_duplicate_checks > 0 {
        lines.push(format!(
            "- Duplicate checks skipped: {} (possible duplicates)",
            report.degraded_duplicate_checks
        ));
    }
    if report.proposals_drafted > 0 {
        lines.push(format!("- Proposals drafted: {}", report.proposals_drafted));
    }

    lines.push(String::new());
    lines.push("## Search Configurations".to_string());
    for config in &report.configs {
        let outcome = match &config.error {
            Some(err) => format!("failed: {err}"),
            None => format!("{} discovered, {} stored", config.discovered, config.stored),
        };
        lines.push(format!("- {} (`{}`): {outcome}", config.name, config.query));
    }

    let mut high_fit = report.high_fit().collect::<Vec<_>>();
    high_fit.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    lines.push(String::new());
    lines.push("## High-Fit Leads".to_string());
    if high_fit.is_empty() {
        lines.push("- none this run".to_string());
    }
    for lead in high_fit {
        lines.push(format!(
            "- [{}]({}) · {} · {} · {:.0}%",
            lead.title,
            lead.identity,
            lead.best_profile.as_deref().unwrap_or("no match"),
            lead.budget,
            lead.confidence * 100.0
        ));
    }

    if !report.failures.is_empty() {
        let mut by_stage: BTreeMap<String, usize> = BTreeMap::new();
        for failure in &report.failures {
            *by_stage.entry(format!("{:?}", failure.stage).to_lowercase()).or_default() += 1;
        }
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for (stage, count) in by_stage {
            lines.push(format!("- {stage}: {count}"));
        }
    }

    if let Some(stats) = stats {
        lines.push(String::new());
        lines.push("## Pipeline".to_string());
        lines.push(format!("- Total leads: {}", stats.total));
        lines.push(format!("- High fit: {}", stats.high_fit));
        lines.push(format!(
            "- Proposals: {} ({}%), interviews: {} ({}%), won: {} ({}%)",
            stats.proposals_submitted,
            stats.proposal_rate,
            stats.interviews,
            stats.interview_rate,
            stats.won,
            stats.win_rate
        ));
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Markdown index of the most recent run directories under `reports/`.
pub fn recent_runs_markdown(runs: usize, workspace_root: &Path) -> Result<String> {
    let reports_root = workspace_root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Campaign Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join(RUN_SUMMARY_FILE);
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let run = summary.get("run");
        let field = |name: &str| {
            run.and_then(|r| r.get(name))
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .unwrap_or_else(|| "?".to_string())
        };

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- mode: {}", field("mode")));
        lines.push(format!("- started: {}", field("started_at")));
        lines.push(format!(
            "- discovered: {}, new: {}, updated: {}",
            field("discovered"),
            field("created"),
            field("merged")
        ));
        lines.push(format!("- summary: `{}`", summary_path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
