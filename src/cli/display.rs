//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::ValidationResult;
use crate::cluster::planner::ClusterSpec;
use crate::runtime::artifacts::RuntimeArtifact;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No servers planned.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(w) => format!("{:width$}", cell, width = *w),
                None => cell.clone(),
            })
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }
    output
}

// ============================================================================
// Plan display
// ============================================================================

/// Planned servers with their ports and mods
pub fn format_plan(cluster: &ClusterSpec) -> String {
    let rows = cluster
        .servers
        .iter()
        .map(|s| {
            vec![
                s.name.clone(),
                s.map.to_string(),
                s.ports.game.to_string(),
                s.ports.query.to_string(),
                s.ports.rcon.to_string(),
                s.max_players.to_string(),
                format_mods(&s.mods),
            ]
        })
        .collect();

    let mut output = format!(
        "Cluster: {} (id {}, {} servers)\n\n",
        cluster.name,
        cluster.id,
        cluster.servers.len()
    );
    output.push_str(&format_table(
        &["name", "map", "game", "query", "rcon", "players", "mods"],
        rows,
    ));
    output
}

fn format_mods(mods: &[u64]) -> String {
    if mods.is_empty() {
        return "-".to_string();
    }
    mods.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(",")
}

// ============================================================================
// Artifact display
// ============================================================================

/// Launch command, environment and config fragments of one server
pub fn format_artifact(artifact: &RuntimeArtifact) -> String {
    let mut output = format!("=== {} ===\n", artifact.server);
    output.push_str(&format!("Checksum: {}\n\n", artifact.checksum));
    output.push_str("Launch command:\n");
    output.push_str(&format!("  {}\n\n", artifact.launch_command));

    output.push_str("Environment:\n");
    for (key, value) in &artifact.environment {
        output.push_str(&format!("  {}={}\n", key, value));
    }

    for (file, content) in &artifact.config_fragments {
        output.push_str(&format!("\n--- {} ---\n", file));
        output.push_str(content);
        if !content.ends_with('\n') {
            output.push('\n');
        }
    }
    output
}

// ============================================================================
// Validation display
// ============================================================================

pub fn format_validation(result: &ValidationResult) -> String {
    if result.valid {
        format!(
            "✓ Cluster request is valid\n  Cluster: {}\n  Servers: {}\n",
            result.cluster.as_deref().unwrap_or("-"),
            result.servers
        )
    } else {
        format!(
            "✗ Cluster request is invalid\n  Error: {}\n",
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}
