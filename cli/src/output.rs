//! Output formatting utilities for CLI commands

use aperture_agent::profile::tree::NodeId;
use aperture_agent::CpuProfile;
use colored::Colorize;

/// Print success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print warning message
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print the title line of a finished profile
pub fn profile_header(profile: &CpuProfile) {
    let duration_ms = profile
        .end_time()
        .map(|end| end.saturating_sub(profile.start_time()) as f64 / 1_000_000.0)
        .unwrap_or(0.0);
    let ticks = profile.with_tree(|tree| tree.total_ticks(NodeId::ROOT));
    println!(
        "\n{} {} ({} ticks, {:.3} ms)",
        "Profile".bold(),
        profile.title().cyan(),
        ticks,
        duration_ms
    );
}
