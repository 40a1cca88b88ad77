//! Drained views of the aggregator and their reporters.

use colored::*;
use prettytable::{color, Attr, Cell, Row, Table};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::stack::StackId;

/// A point-in-time copy of the aggregation table.
///
/// Produced by [`Aggregator::snapshot`](crate::Aggregator::snapshot). Entries are ordered
/// by total bytes, largest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
    pub dropped_events: u64,
    pub table_len: usize,
    pub table_capacity: usize,
    pub stacks_len: usize,
    pub stacks_capacity: usize,
}

/// One `(process, stack)` bucket with its resolved frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub pid: u32,
    pub stack_id: StackId,
    pub type_name: String,
    pub count: u64,
    pub size: u64,
    pub tlab_size: u64,
    /// Innermost first; empty when the stack was never captured or has been replaced.
    pub frames: Vec<u64>,
}

impl SnapshotEntry {
    pub fn avg_size(&self) -> u64 {
        self.size.checked_div(self.count).unwrap_or(0)
    }

    pub fn avg_tlab_size(&self) -> u64 {
        self.tlab_size.checked_div(self.count).unwrap_or(0)
    }

    fn display_type(&self) -> &str {
        if self.type_name.is_empty() {
            "<unknown>"
        } else {
            &self.type_name
        }
    }
}

impl Snapshot {
    pub fn total_count(&self) -> u64 {
        self.entries.iter().map(|e| e.count).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Keeps only the `limit` largest entries; 0 keeps all.
    pub fn truncate(&mut self, limit: usize) {
        if limit > 0 {
            self.entries.truncate(limit);
        }
    }
}

/// Trait for consuming drained allocation data.
///
/// # Examples
///
/// ```rust
/// use tlabscope::{Reporter, Snapshot};
/// use std::error::Error;
///
/// struct Summary;
///
/// impl Reporter for Summary {
///     fn report(&self, snapshot: &Snapshot) -> Result<(), Box<dyn Error>> {
///         println!("{} buckets, {} dropped", snapshot.entries.len(), snapshot.dropped_events);
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter: Send + Sync {
    fn report(&self, snapshot: &Snapshot) -> Result<(), Box<dyn std::error::Error>>;
}

/// Built-in report layouts.
///
/// * `Table` - one row per bucket (default)
/// * `Text` - per-bucket block with totals, averages and raw stack frames
/// * `Json` - compact JSON of the [`Snapshot`]
/// * `JsonPretty` - indented JSON of the [`Snapshot`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Table,
    Text,
    Json,
    JsonPretty,
}

impl Format {
    pub fn reporter(self) -> Box<dyn Reporter> {
        match self {
            Format::Table => Box::new(TableReporter),
            Format::Text => Box::new(TextReporter),
            Format::Json => Box::new(JsonReporter),
            Format::JsonPretty => Box::new(JsonPrettyReporter),
        }
    }

    /// Renders `snapshot` without terminal styling.
    pub fn render(self, snapshot: &Snapshot) -> Result<String, serde_json::Error> {
        Ok(match self {
            Format::Table => build_table(snapshot, false).to_string(),
            Format::Text => render_text(snapshot),
            Format::Json => serde_json::to_string(snapshot)?,
            Format::JsonPretty => serde_json::to_string_pretty(snapshot)?,
        })
    }
}

impl FromStr for Format {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" => Ok(Format::Table),
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            "json-pretty" => Ok(Format::JsonPretty),
            _ => Err(ConfigError::UnknownFormat(s.to_string())),
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log(THRESHOLD).floor() as usize).min(UNITS.len() - 1);
    let unit_value = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", unit_value, UNITS[unit_index])
    }
}

const HEADERS: [&str; 8] = [
    "Type",
    "PID",
    "Stack",
    "Count",
    "Total Size",
    "Avg Size",
    "Total TLAB",
    "Avg TLAB",
];

fn build_table(snapshot: &Snapshot, use_colors: bool) -> Table {
    let mut table = Table::new();

    let header_cells: Vec<Cell> = HEADERS
        .iter()
        .map(|header| {
            if use_colors {
                Cell::new(header)
                    .with_style(Attr::Bold)
                    .with_style(Attr::ForegroundColor(color::CYAN))
            } else {
                Cell::new(header).with_style(Attr::Bold)
            }
        })
        .collect();
    table.add_row(Row::new(header_cells));

    for entry in &snapshot.entries {
        table.add_row(Row::new(vec![
            Cell::new(entry.display_type()),
            Cell::new(&entry.pid.to_string()),
            Cell::new(&entry.stack_id.to_string()),
            Cell::new(&entry.count.to_string()),
            Cell::new(&format_bytes(entry.size)),
            Cell::new(&format_bytes(entry.avg_size())),
            Cell::new(&format_bytes(entry.tlab_size)),
            Cell::new(&format_bytes(entry.avg_tlab_size())),
        ]));
    }

    table
}

fn render_text(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for entry in &snapshot.entries {
        let _ = writeln!(out, "Type: {} Count: {}", entry.display_type(), entry.count);
        let _ = writeln!(
            out,
            " Total TLAB Size: {} bytes, Avg TLAB Size {} bytes",
            entry.tlab_size,
            entry.avg_tlab_size()
        );
        let _ = writeln!(
            out,
            " Total Object Size: {} bytes, Avg Object Size {} bytes",
            entry.size,
            entry.avg_size()
        );
        let _ = writeln!(out, " Stacktrace:");
        if entry.frames.is_empty() {
            let _ = writeln!(out, "\t[unknown]");
        }
        for ip in &entry.frames {
            let _ = writeln!(out, "\t{:#018x}", ip);
        }
        let _ = writeln!(out);
    }
    out
}

fn print_header(snapshot: &Snapshot) {
    println!(
        "{} {} allocations in {} buckets ({}), {} dropped",
        "[tlabscope]".blue().bold(),
        snapshot.total_count(),
        snapshot.entries.len(),
        format_bytes(snapshot.total_size()),
        snapshot.dropped_events
    );
}

fn display_no_allocations_message() {
    println!(
        "{} No allocations recorded. Is an aggregator installed and are the {} hooks attached?",
        "[tlabscope]".blue().bold(),
        crate::RUNTIME_LIBRARY.yellow().bold()
    );
}

pub struct TableReporter;

impl Reporter for TableReporter {
    fn report(&self, snapshot: &Snapshot) -> Result<(), Box<dyn std::error::Error>> {
        if snapshot.entries.is_empty() {
            display_no_allocations_message();
            return Ok(());
        }

        let use_colors = std::env::var("NO_COLOR").is_err();
        print_header(snapshot);
        build_table(snapshot, use_colors).printstd();
        Ok(())
    }
}

pub struct TextReporter;

impl Reporter for TextReporter {
    fn report(&self, snapshot: &Snapshot) -> Result<(), Box<dyn std::error::Error>> {
        if snapshot.entries.is_empty() {
            display_no_allocations_message();
            return Ok(());
        }

        print_header(snapshot);
        print!("{}", render_text(snapshot));
        Ok(())
    }
}

pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn report(&self, snapshot: &Snapshot) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string(snapshot)?);
        Ok(())
    }
}

pub struct JsonPrettyReporter;

impl Reporter for JsonPrettyReporter {
    fn report(&self, snapshot: &Snapshot) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        Ok(())
    }
}
