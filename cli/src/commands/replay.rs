//! Replay command implementation
//!
//! A trace is a JSON-lines file. Each line is one [`TraceRecord`]: a code
//! event, a tick sample, or a session start/stop. Records are applied in
//! file order.

use anyhow::{Context, Result};
use aperture_agent::output::{json, text};
use aperture_agent::{CpuProfiler, ProfilerConfig, StartProfilingStatus};
use aperture_shared::types::events::{CodeEvent, TickSample};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::output;

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Trace file, one JSON record per line
    pub trace: PathBuf,

    /// Also write the finished profiles as JSON
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Configuration file (defaults to ./aperture.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Leave unsymbolized samples at the root instead of VM-state buckets
    #[arg(long)]
    pub no_vm_state: bool,

    /// Print the code map as it stands after the replay
    #[arg(long)]
    pub dump_code_map: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// One line of a trace file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TraceRecord {
    Code(CodeEvent),
    Tick(TickSample),
    Start {
        title: String,
        #[serde(default)]
        record_samples: Option<bool>,
    },
    Stop {
        #[serde(default)]
        title: String,
    },
}

/// Counters for a replayed trace
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub code_events: usize,
    pub ticks: usize,
    pub refused_starts: usize,
    pub unmatched_stops: usize,
}

pub async fn run(args: ReplayArgs) -> Result<()> {
    let mut config = ProfilerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if args.no_vm_state {
        config.attribute_vm_state = false;
    }
    let profiler = CpuProfiler::new(config).context("Failed to create profiler")?;

    let file = File::open(&args.trace)
        .with_context(|| format!("Failed to open trace file: {}", args.trace.display()))?;
    let summary = replay(&profiler, BufReader::new(file)).await?;
    info!(
        "Replayed {} code events and {} ticks from {}",
        summary.code_events,
        summary.ticks,
        args.trace.display()
    );
    if summary.refused_starts > 0 {
        output::warning(&format!(
            "{} session starts refused: more than {} simultaneous profiles",
            summary.refused_starts,
            profiler.config().max_simultaneous_profiles
        ));
    }
    if summary.unmatched_stops > 0 {
        output::warning(&format!(
            "{} stop records matched no running session",
            summary.unmatched_stops
        ));
    }

    let still_running = profiler.profiles().current_count();
    if still_running > 0 {
        output::warning(&format!(
            "{} sessions still running at end of trace, stopping them",
            still_running
        ));
        while profiler.stop_profiling("").await?.is_some() {}
    }

    let profiles: Vec<_> = (0..profiler.profiles_count())
        .filter_map(|i| profiler.profile(i))
        .collect();
    if profiles.is_empty() {
        output::info("No profiles recorded");
    }

    let stdout = io::stdout();
    for profile in &profiles {
        output::profile_header(profile);
        text::write_tree(profile, &mut stdout.lock()).context("Failed to print profile")?;
    }

    if args.dump_code_map {
        println!("\nCode map:");
        print!("{}", profiler.code_map_dump());
    }

    if let Some(path) = &args.json {
        let snapshots: Vec<_> = profiles.iter().map(|p| p.snapshot()).collect();
        json::write_json_all(&snapshots, path)
            .with_context(|| format!("Failed to write JSON output: {}", path.display()))?;
        output::success(&format!("Profiles written to {}", path.display()));
    }

    Ok(())
}

/// Apply every record of `reader` to `profiler`.
pub async fn replay(profiler: &CpuProfiler, reader: impl BufRead) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();

    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("Failed to read trace line {}", line_no))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let record: TraceRecord = serde_json::from_str(line)
            .with_context(|| format!("Invalid trace record on line {}", line_no))?;
        match record {
            TraceRecord::Code(event) => {
                profiler.code_event(event)?;
                summary.code_events += 1;
            }
            TraceRecord::Tick(sample) => {
                profiler.record_tick(sample)?;
                summary.ticks += 1;
            }
            TraceRecord::Start {
                title,
                record_samples,
            } => {
                let record_samples = record_samples.unwrap_or(profiler.config().record_samples);
                let status = profiler.start_profiling(&title, record_samples).await?;
                debug!("Start '{}' on line {}: {:?}", title, line_no, status);
                if status == StartProfilingStatus::TooManyProfiles {
                    summary.refused_starts += 1;
                }
            }
            TraceRecord::Stop { title } => {
                if profiler.stop_profiling(&title).await?.is_none() {
                    debug!("Stop '{}' on line {} matched no session", title, line_no);
                    summary.unmatched_stops += 1;
                }
            }
        }
    }

    Ok(summary)
}
