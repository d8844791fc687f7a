//! Output rendering for probectl.
//!
//! Everything user-facing goes through an [`OutputSink`] so the session can
//! run against an in-memory sink in tests. [`StepReporter`] turns settled
//! steps into console lines, fixed-width table rows and JSON records.

use clap::ValueEnum;
use colored::Colorize;
use probe_core::types::{RunStatus, Step, StepRecord, STEP_MODE_FETCH};
use std::sync::Arc;
use tracing::warn;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Incremental step lines
    #[default]
    Text,
    /// Fixed-width step table
    Table,
    /// Final JSON document only
    Json,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(Self::Text),
            "table" => Some(Self::Table),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Colour hint for a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Info,
    Success,
    Warning,
    Failure,
}

/// Destination for everything the CLI shows the user.
pub trait OutputSink: Send + Sync {
    /// Session notices and summaries. Always shown.
    fn notice(&self, tone: Tone, text: &str);
    /// One settled step, text mode.
    fn step_line(&self, tone: Tone, text: &str);
    /// One fixed-width row, table mode.
    fn table_row(&self, columns: &[String]);
    /// Final structured result, json mode.
    fn emit_json(&self, value: &serde_json::Value);
}

/// Sink writing to the terminal.
///
/// In json mode notices go to stderr so stdout stays machine readable.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleSink {
    format: OutputFormat,
}

impl ConsoleSink {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

fn paint(tone: Tone, text: &str) -> String {
    match tone {
        Tone::Info => text.to_string(),
        Tone::Success => text.green().to_string(),
        Tone::Warning => text.yellow().to_string(),
        Tone::Failure => text.red().to_string(),
    }
}

impl OutputSink for ConsoleSink {
    fn notice(&self, tone: Tone, text: &str) {
        if self.format == OutputFormat::Json {
            eprintln!("{}", paint(tone, text));
        } else {
            println!("{}", paint(tone, text));
        }
    }

    fn step_line(&self, tone: Tone, text: &str) {
        if self.format == OutputFormat::Text {
            let stamp = chrono::Local::now().format("%H:%M:%S");
            println!("[{stamp}] {}", paint(tone, text));
        }
    }

    fn table_row(&self, columns: &[String]) {
        if self.format == OutputFormat::Table {
            println!("{}", format_table_line(columns));
        }
    }

    fn emit_json(&self, value: &serde_json::Value) {
        if self.format == OutputFormat::Json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_default()
            );
        }
    }
}

// --- Step formatting ---

const TABLE_HEADER: [&str; 4] = ["#", "STATUS", "DESCRIPTION", "TIME"];
const DESCRIPTION_WIDTH: usize = 48;

/// Tag shown for a step: `INFO` for fetch-mode steps, otherwise the status.
pub fn step_tag(record: &StepRecord) -> String {
    if record.is_info() {
        "INFO".to_string()
    } else {
        record.status.as_str().to_uppercase()
    }
}

pub fn step_tone(record: &StepRecord) -> Tone {
    if record.is_info() {
        return Tone::Info;
    }
    match record.status {
        RunStatus::Success => Tone::Success,
        RunStatus::Terminated => Tone::Warning,
        RunStatus::Failure | RunStatus::Error | RunStatus::SystemError => Tone::Failure,
        RunStatus::Init | RunStatus::Created | RunStatus::Pending => Tone::Info,
    }
}

/// Console line for a step, without timestamp.
pub fn format_step_line(record: &StepRecord) -> String {
    let mut line = format!(
        "#{} [{}] {} ({:.2}s)",
        record.index,
        step_tag(record),
        record.description,
        record.time
    );
    if let Some(error) = record.error.as_deref().filter(|e| !e.is_empty()) {
        line.push_str(": ");
        line.push_str(error);
    }
    line
}

/// Table columns for a step.
pub fn format_step_row(record: &StepRecord) -> Vec<String> {
    vec![
        record.index.to_string(),
        step_tag(record),
        truncate(&record.description, DESCRIPTION_WIDTH),
        format!("{:.2}s", record.time),
    ]
}

/// Render table columns at fixed widths.
pub fn format_table_line(columns: &[String]) -> String {
    let col = |i: usize| columns.get(i).map_or("", String::as_str);
    format!(
        "{:<5}  {:<12}  {:<width$}  {:>9}",
        col(0),
        col(1),
        col(2),
        col(3),
        width = DESCRIPTION_WIDTH
    )
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

/// Reports each settled step exactly once.
///
/// The counter is shared by every attempt of a session so numbering never
/// restarts after a relaunch.
pub struct StepReporter {
    sink: Arc<dyn OutputSink>,
    counter: u32,
    records: Vec<StepRecord>,
    header_printed: bool,
}

impl std::fmt::Debug for StepReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepReporter")
            .field("counter", &self.counter)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl StepReporter {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            counter: 0,
            records: Vec::new(),
            header_printed: false,
        }
    }

    /// Number and emit a settled step. Pending steps are ignored.
    ///
    /// A `fetch` status is informational. Any other status the client does
    /// not know is reported as `system_error`.
    pub fn report(&mut self, step: &Step) -> Option<StepRecord> {
        if step.is_pending() {
            return None;
        }
        let (status, mode) = match step.status() {
            Some(status) => (status, step.mode.clone()),
            None if step.status == STEP_MODE_FETCH => {
                (RunStatus::Success, Some(STEP_MODE_FETCH.to_string()))
            }
            None => {
                warn!(
                    status = %step.status,
                    description = %step.description,
                    "unrecognized step status, reporting as system_error"
                );
                (RunStatus::SystemError, step.mode.clone())
            }
        };
        self.counter += 1;
        let record = StepRecord {
            index: self.counter,
            status,
            description: step.description.clone(),
            time: step.time,
            error: step.error.clone(),
            mode,
        };
        self.emit(&record);
        self.records.push(record.clone());
        Some(record)
    }

    /// Emit an already numbered record, e.g. from a saved JSON result.
    pub fn replay(&mut self, record: &StepRecord) {
        self.counter = self.counter.max(record.index);
        self.emit(record);
        self.records.push(record.clone());
    }

    fn emit(&mut self, record: &StepRecord) {
        self.sink
            .step_line(step_tone(record), &format_step_line(record));
        if !self.header_printed {
            let header: Vec<String> = TABLE_HEADER.iter().map(|h| (*h).to_string()).collect();
            self.sink.table_row(&header);
            self.header_printed = true;
        }
        self.sink.table_row(&format_step_row(record));
    }

    /// Steps reported so far, in report order.
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn count(&self) -> u32 {
        self.counter
    }
}
