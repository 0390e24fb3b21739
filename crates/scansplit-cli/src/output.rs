use std::io::Write;

use owo_colors::OwoColorize;
use scansplit_core::{
    CategoryTaxonomy, GroupState, GroupingPolicy, Health, OrderSource, PipelineStatus,
    ProgressEvent, ScanState,
};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// One-line spinner message for a running scan.
pub fn describe_progress(status: &PipelineStatus) -> String {
    match status.state {
        ScanState::Ordering => {
            let done = status
                .groups
                .iter()
                .filter(|g| matches!(g.state, GroupState::Ordered | GroupState::OrderingFailed))
                .count();
            format!("ordering {}/{} documents", done, status.groups.len())
        }
        ScanState::Finalized | ScanState::PartiallyFinalized => {
            format!("filing {}/{} documents", status.filed, status.documents.len())
        }
        state => state.to_string(),
    }
}

/// Final spinner message for a finished scan.
pub fn describe_outcome(status: &PipelineStatus, color: ColorMode) -> String {
    let docs = status.documents.len();
    match status.health() {
        Health::Done => {
            let label = "DONE";
            if color.enabled() {
                format!("{} {docs} document(s) filed", label.green())
            } else {
                format!("{label} {docs} document(s) filed")
            }
        }
        Health::Degraded => {
            let label = "DEGRADED";
            let text = format!(
                "{docs} document(s) filed, {} in scan order",
                status.fallback_groups()
            );
            if color.enabled() {
                format!("{} {text}", label.yellow())
            } else {
                format!("{label} {text}")
            }
        }
        Health::Failed => {
            let label = "FAILED";
            if color.enabled() {
                format!("{} {}", label.red(), status.state)
            } else {
                format!("{label} {}", status.state)
            }
        }
        Health::Working => status.state.to_string(),
    }
}

/// A progress event worth showing above the spinners, if any.
pub fn format_event(event: &ProgressEvent, color: ColorMode) -> Option<String> {
    match event {
        ProgressEvent::AttemptFailed {
            scan_id,
            step,
            attempt,
            max_attempts,
            error,
        } => {
            let head = format!("{scan_id}: {step} attempt {attempt}/{max_attempts} failed:");
            Some(if color.enabled() {
                format!("{} {}", head.yellow(), error.dimmed())
            } else {
                format!("{head} {error}")
            })
        }
        ProgressEvent::GroupOrdered {
            scan_id,
            group,
            fallback: true,
        } => {
            let msg = format!(
                "{scan_id}: document {} kept in scan order after ordering failed",
                group + 1
            );
            Some(if color.enabled() {
                msg.yellow().to_string()
            } else {
                msg
            })
        }
        _ => None,
    }
}

/// Per-scan report: documents with their page order, then any errors.
pub fn print_scan_report(
    w: &mut dyn Write,
    status: &PipelineStatus,
    color: ColorMode,
) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} ({})", status.scan_id.bold(), status.state)?;
    } else {
        writeln!(w, "{} ({})", status.scan_id, status.state)?;
    }

    for doc in &status.documents {
        let pages = doc
            .ordered_pages
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let marker = match doc.order_source {
            OrderSource::Model => "",
            OrderSource::Fallback => " [scan order]",
        };
        writeln!(
            w,
            "  {}  {} / {}  pages {}{}",
            doc.id, doc.label, doc.title, pages, marker
        )?;
    }

    for error in &status.errors {
        if color.enabled() {
            writeln!(w, "  {} {}", "!".red(), error)?;
        } else {
            writeln!(w, "  ! {}", error)?;
        }
    }
    Ok(())
}

/// Totals across every scan of the run.
pub fn print_summary(
    w: &mut dyn Write,
    statuses: &[PipelineStatus],
    color: ColorMode,
) -> std::io::Result<()> {
    let count = |h: Health| statuses.iter().filter(|s| s.health() == h).count();
    let (done, degraded, failed) = (count(Health::Done), count(Health::Degraded), count(Health::Failed));
    let documents: usize = statuses.iter().map(|s| s.filed).sum();

    writeln!(w)?;
    writeln!(w, "{} scan(s), {} document(s) filed", statuses.len(), documents)?;
    if color.enabled() {
        writeln!(
            w,
            "  {} done, {} degraded, {} failed",
            done.green(),
            degraded.yellow(),
            failed.red()
        )?;
    } else {
        writeln!(w, "  {done} done, {degraded} degraded, {failed} failed")?;
    }
    if failed > 0 {
        writeln!(
            w,
            "  Failed scans were left in place; cancelled scans can be rerun as-is."
        )?;
    }
    Ok(())
}

pub fn print_taxonomy(
    w: &mut dyn Write,
    taxonomy: &CategoryTaxonomy,
    policy: Option<&GroupingPolicy>,
    color: ColorMode,
) -> std::io::Result<()> {
    match policy {
        Some(p) => writeln!(w, "Grouping policy: {}", p.name())?,
        None => writeln!(w, "Grouping policy: (not configured)")?,
    }
    writeln!(w, "{} categories:", taxonomy.len())?;
    for c in taxonomy.iter() {
        if color.enabled() {
            writeln!(w, "  {:<20} -> {}", c.key.cyan(), c.label)?;
        } else {
            writeln!(w, "  {:<20} -> {}", c.key, c.label)?;
        }
    }
    Ok(())
}
