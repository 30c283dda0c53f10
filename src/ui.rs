//! Terminal output: a progress bar that follows a running batch, plus
//! coloured tables for previews, results and stored jobs.
//!
//! Uses `indicatif` for the bar and `console` for styling.

use std::sync::Mutex;

use async_trait::async_trait;
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::{BatchJob, BatchPreview, BatchResult, JobStatus};
use crate::events::BatchObserver;

/// `1250` → `$12.50`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}${}.{:02}", cents / 100, cents % 100)
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
        JobStatus::Interrupted | JobStatus::Executing => Style::new().yellow(),
        JobStatus::Pending | JobStatus::Previewing => Style::new().cyan(),
    }
}

/// Observer that draws a progress bar for the batch being executed.
pub struct ConsoleProgress {
    bar: Mutex<Option<ProgressBar>>,
    green: Style,
    red: Style,
    yellow: Style,
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let bar = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = bar.as_ref() {
            f(bar);
        }
    }

    fn finish(&self) -> Option<ProgressBar> {
        let bar = self.bar.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(bar) = &bar {
            bar.finish_and_clear();
        }
        bar
    }
}

#[async_trait]
impl BatchObserver for ConsoleProgress {
    async fn batch_started(&self, job_id: &str, total_rows: u32) -> anyhow::Result<()> {
        let bar = ProgressBar::new(u64::from(total_rows));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(format!("job {job_id}"));
        bar.enable_steady_tick(std::time::Duration::from_millis(100));
        *self.bar.lock().unwrap_or_else(|e| e.into_inner()) = Some(bar);
        Ok(())
    }

    async fn row_started(&self, _job_id: &str, row_number: u32) -> anyhow::Result<()> {
        self.with_bar(|bar| bar.set_message(format!("shipping row {row_number}")));
        Ok(())
    }

    async fn row_completed(
        &self,
        _job_id: &str,
        row_number: u32,
        tracking_number: &str,
        cost_cents: i64,
    ) -> anyhow::Result<()> {
        self.with_bar(|bar| {
            bar.set_position(u64::from(row_number));
            bar.println(format!(
                "  {} Row {row_number}: {tracking_number} ({})",
                self.green.apply_to("✓"),
                format_cents(cost_cents)
            ));
        });
        Ok(())
    }

    async fn row_failed(
        &self,
        _job_id: &str,
        row_number: u32,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        self.with_bar(|bar| {
            bar.println(format!(
                "  {} Row {row_number}: {error_code} {error_message}",
                self.red.apply_to("✗")
            ));
        });
        Ok(())
    }

    async fn batch_completed(
        &self,
        job_id: &str,
        total_rows: u32,
        successful: u32,
        total_cost_cents: i64,
    ) -> anyhow::Result<()> {
        self.finish();
        println!(
            "  {} Job {job_id} completed: {successful}/{total_rows} shipped, {}",
            self.green.apply_to("✓"),
            format_cents(total_cost_cents)
        );
        Ok(())
    }

    async fn batch_failed(
        &self,
        job_id: &str,
        error_code: &str,
        error_message: &str,
        processed: u32,
    ) -> anyhow::Result<()> {
        self.finish();
        println!(
            "  {} Job {job_id} stopped after {processed} rows: {error_code} {error_message}",
            self.red.apply_to("✗")
        );
        Ok(())
    }

    async fn batch_interrupted(&self, job_id: &str, processed: u32) -> anyhow::Result<()> {
        self.finish();
        println!(
            "  {} Job {job_id} interrupted after {processed} rows. Run `shipflow resume {job_id}` to continue.",
            self.yellow.apply_to("↻")
        );
        Ok(())
    }
}

pub fn print_preview(preview: &BatchPreview) {
    let bold = Style::new().bold();
    let yellow = Style::new().yellow();
    println!("{}", bold.apply_to(format!("Preview for job {}", preview.job_id)));
    println!(
        "  {:>4}  {:<20}  {:<22}  {:<18}  {:>10}",
        "Row", "Recipient", "Destination", "Service", "Estimate"
    );
    for row in &preview.preview_rows {
        println!(
            "  {:>4}  {:<20}  {:<22}  {:<18}  {:>10}",
            row.row_number,
            row.recipient_name,
            row.city_state,
            row.service,
            format_cents(row.estimated_cost_cents)
        );
        for warning in &row.warnings {
            println!("        {} {warning}", yellow.apply_to("!"));
        }
    }
    if preview.additional_rows > 0 {
        println!("  ... and {} more rows (estimated)", preview.additional_rows);
    }
    println!(
        "  Total: {} rows, estimated {}{}",
        preview.total_rows,
        format_cents(preview.total_estimated_cost_cents),
        if preview.rows_with_warnings > 0 {
            format!(", {} with warnings", preview.rows_with_warnings)
        } else {
            String::new()
        }
    );
}

pub fn print_result(result: &BatchResult) {
    let style = status_style(result.status);
    println!(
        "{} {}/{} rows shipped, {} total",
        style.apply_to(result.status.to_string()),
        result.successful,
        result.total_rows,
        format_cents(result.total_cost_cents)
    );
    if let Some(error) = &result.error {
        println!("  {}", Style::new().red().apply_to(error.to_string()));
    }
    for row in &result.needs_review {
        println!(
            "  {} row {row} may have shipped before the interruption; check the carrier account",
            Style::new().yellow().apply_to("review:")
        );
    }
    for label in &result.labels {
        println!("  label: {label}");
    }
}

pub fn print_jobs(jobs: &[BatchJob]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    for job in jobs {
        println!(
            "  {:<38}  {:<12}  {:>3}/{:<3}  {}",
            job.id,
            status_style(job.status).apply_to(job.status.to_string()),
            job.successful(),
            job.total_rows(),
            job.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}
