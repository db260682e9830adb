//! Output formatting utilities for the CLI
//!
//! Fleet reports are shown as tables, or as JSON with `--json`. Status lines
//! are colored with crossterm.

use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use df_orchestrator::FleetReport;

/// Format a fleet report as an ASCII table
///
/// Returns "No hosts" when the report is empty.
pub fn format_report(report: &FleetReport) -> String {
    if report.hosts.is_empty() {
        return "No hosts".to_string();
    }

    #[derive(Tabled)]
    struct HostRow {
        #[tabled(rename = "HOST")]
        host: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "DETAIL")]
        detail: String,
    }

    let rows: Vec<HostRow> = report
        .hosts
        .iter()
        .map(|h| HostRow {
            host: h.host.clone(),
            status: h.outcome.label().to_string(),
            detail: h
                .outcome
                .detail()
                .map(|d| truncate(first_line(d), 200))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(120))
        .to_string()
}

/// One-line summary such as `deploy: 2 ok, 1 removed`
pub fn format_summary(report: &FleetReport) -> String {
    let parts: Vec<String> = ["ok", "skipped", "failed", "removed"]
        .iter()
        .filter_map(|label| match report.count(label) {
            0 => None,
            n => Some(format!("{} {}", n, label)),
        })
        .collect();

    if parts.is_empty() {
        format!("{}: no hosts", report.operation)
    } else {
        format!("{}: {}", report.operation, parts.join(", "))
    }
}

/// Print a report as a table with a colored summary, or as JSON
pub fn print_report(report: &FleetReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => print_error(&format!("Failed to encode report: {}", e)),
        }
        return;
    }

    println!("{}", format_report(report));
    let summary = format_summary(report);
    if report.is_success() {
        print_success(&summary);
    } else {
        print_error(&summary);
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow
///
/// Outputs to stderr.
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use df_orchestrator::Outcome;

    #[test]
    fn test_summary_counts() {
        let mut report = FleetReport::new("deploy");
        report.push("a (10.0.0.1)", Outcome::Succeeded);
        report.push("b (10.0.0.2)", Outcome::Succeeded);
        report.push("c (10.0.0.3)", Outcome::Removed("sink refused".into()));
        assert_eq!(format_summary(&report), "deploy: 2 ok, 1 removed");

        assert_eq!(format_summary(&FleetReport::new("start")), "start: no hosts");
    }

    #[test]
    fn test_table_shows_first_detail_line() {
        let mut report = FleetReport::new("start");
        report.push(
            "a (10.0.0.1)",
            Outcome::Failed("exited with status 5\nUnit not found".into()),
        );
        let table = format_report(&report);
        assert!(table.contains("exited with status 5"));
        assert!(!table.contains("Unit not found"));
        assert!(table.contains("failed"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
    }
}
