use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use flp_adapters::extract_budget;
use flp_core::{ListingRecord, PipelineStatus};
use flp_scoring::ProfileCatalog;
use flp_storage::{MarkOutcome, PgTracker};
use flp_sync::{
    recent_runs_markdown, retry_pending_from_env, run_campaign_from_env, CancelHandle, SyncConfig,
};
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "flp-cli")]
#[command(about = "Freelance lead pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover, score and store leads for a campaign mode.
    Run {
        /// full, executive, strategic, coaching or quick; unknown names run quick.
        #[arg(long, default_value = "quick")]
        mode: String,
    },
    /// Set the pipeline status of a tracked lead.
    MarkStatus { url: String, status: String },
    /// Log a submitted proposal against a tracked lead.
    RecordProposal {
        url: String,
        #[arg(long)]
        words: u32,
    },
    Stats,
    Profiles,
    /// Score an ad-hoc listing against the profile catalog.
    Score {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        budget: String,
    },
    /// Upsert again the listings a recorded run failed to save.
    RetryPending { run_id: String },
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Create the postgres tracker schema.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        mode: "quick".to_string(),
    }) {
        Commands::Run { mode } => run(&mode).await?,
        Commands::MarkStatus { url, status } => {
            let status: PipelineStatus = status.parse().map_err(anyhow::Error::msg)?;
            let mut store = flp_sync::open_store(&SyncConfig::from_env()).await?;
            match store.mark_status(&url, status, Utc::now()).await? {
                MarkOutcome::Updated => println!("{url}: {status}"),
                MarkOutcome::NotFound => bail!("no tracked lead for {url}"),
            }
        }
        Commands::RecordProposal { url, words } => {
            let mut store = flp_sync::open_store(&SyncConfig::from_env()).await?;
            match store.record_proposal(&url, words, Utc::now()).await? {
                MarkOutcome::Updated => println!("{url}: proposal logged ({words} words)"),
                MarkOutcome::NotFound => bail!("no tracked lead for {url}"),
            }
        }
        Commands::Stats => {
            let store = flp_sync::open_store(&SyncConfig::from_env()).await?;
            let stats = store.stats().await?;
            println!("total leads:        {}", stats.total);
            println!("prospecting:        {}", stats.prospecting);
            println!("updated:            {}", stats.updated);
            println!("proposals:          {} ({}%)", stats.proposals_submitted, stats.proposal_rate);
            println!("interviews:         {} ({}%)", stats.interviews, stats.interview_rate);
            println!("won:                {} ({}%)", stats.won, stats.win_rate);
            println!("lost:               {}", stats.lost);
            println!("high fit:           {}", stats.high_fit);
        }
        Commands::Profiles => {
            let config = SyncConfig::from_env();
            let catalog = ProfileCatalog::load_or_default(&config.workspace_root)?;
            for profile in catalog.summary() {
                println!("{} · {}", profile.name, profile.budget_range);
                println!("  {}", profile.description);
                println!("  duration: {}", profile.ideal_duration.join(", "));
            }
        }
        Commands::Score {
            title,
            description,
            budget,
        } => score(&title, &description, &budget)?,
        Commands::RetryPending { run_id } => {
            let output = retry_pending_from_env(&run_id).await?;
            println!(
                "retried run {run_id}: saved={} still_pending={}",
                output.saved,
                output.still_pending.len()
            );
            for failure in &output.still_pending {
                println!(
                    "  {}: {}",
                    failure.identity.as_deref().unwrap_or("?"),
                    failure.message
                );
            }
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!("{}", recent_runs_markdown(runs, &config.workspace_root)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            PgTracker::connect(url).await?.ensure_schema().await?;
            println!("tracker schema ready");
        }
    }

    Ok(())
}

async fn run(mode: &str) -> Result<()> {
    let cancel = CancelHandle::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current listing");
            interrupt.cancel();
        }
    });

    let output = run_campaign_from_env(mode, cancel).await?;
    let report = &output.report;
    println!(
        "run complete: run_id={} mode={} state={:?} discovered={} new={} updated={} failures={}{} reports={}",
        report.run_id,
        report.mode,
        report.state,
        report.discovered,
        report.created,
        report.merged,
        report.failures.len(),
        if report.cancelled { " (cancelled)" } else { "" },
        output.reports_dir.display()
    );
    for failure in &report.failures {
        println!(
            "  {:?} failure in {}{}: {}",
            failure.stage,
            failure.config,
            failure
                .identity
                .as_deref()
                .map(|id| format!(" ({id})"))
                .unwrap_or_default(),
            failure.message
        );
    }
    Ok(())
}

fn score(title: &str, description: &str, budget_text: &str) -> Result<()> {
    let config = SyncConfig::from_env();
    let catalog = ProfileCatalog::load_or_default(&config.workspace_root)?;

    let mut listing = ListingRecord::empty("cli", Utc::now());
    listing.title = title.to_string();
    listing.description = description.to_string();
    let (budget, evidence) = extract_budget(budget_text);
    listing.budget = budget;
    listing.budget_evidence = evidence;

    let fit = catalog.score(&listing);
    println!("best profile: {}", fit.best_profile.as_deref().unwrap_or("none"));
    println!("fit: {} (score {}, confidence {:.0}%)", fit.fit_tier, fit.raw_score, fit.confidence * 100.0);
    println!("budget: {} · {}", listing.budget, fit.budget_fit.label());
    println!("duration: {}", fit.duration_fit.label());
    if !fit.extracted_pain_points.is_empty() {
        println!("pain points: {}", fit.extracted_pain_points.join(", "));
    }
    println!("{}", fit.reasoning);
    for profile in &fit.profile_scores {
        println!("  {:<22} {:>5}", profile.profile, profile.total);
    }
    Ok(())
}
