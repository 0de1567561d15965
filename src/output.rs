//! Terminal rendering of command outcomes.

use crate::catalog::{TableDescription, TableInfo};
use crate::dispatcher::{HELP_DIRECTIVE, Outcome, QUIT_DIRECTIVES, ResultSink};
use crate::handle::QueryOutput;
use async_trait::async_trait;
use clap::ValueEnum;
use colored::*;
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Narrowest a column is squeezed to when fitting the terminal.
const MIN_COLUMN_WIDTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Prints outcomes to stdout, failures to stderr.
pub struct TerminalSink {
    format: OutputFormat,
    verbose: bool,
}

impl TerminalSink {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    fn print_rows(&self, output: &QueryOutput, elapsed: Duration) {
        for notice in &output.notices {
            eprintln!("{}", notice.yellow());
        }

        if !output.columns.is_empty() {
            match self.format {
                OutputFormat::Table => print!("{}", render_table(output, terminal_width())),
                OutputFormat::Json => println!("{}", render_json(output)),
            }
        } else if let Some(tag) = &output.command_tag {
            println!("{} {}", "✓".green(), tag);
        }

        if self.verbose {
            println!(
                "{}",
                format!("Time: {:.3} ms", elapsed.as_secs_f64() * 1000.0).dimmed()
            );
        }
    }
}

#[async_trait]
impl ResultSink for TerminalSink {
    async fn report(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Rows { output, elapsed } => self.print_rows(output, *elapsed),
            Outcome::QueryFailed { message } => {
                eprintln!("{} {}", "❌".red(), message.red());
            }
            Outcome::Cancelled { message } => {
                println!("{}", "⏹️  Query cancelled by user".yellow());
                if self.verbose {
                    println!("{}", message.dimmed());
                }
            }
            Outcome::Rejected { message } => {
                eprintln!("{} {}", "⚠".yellow(), message.yellow());
            }
            Outcome::Help => print_help(),
            Outcome::Tables(tables) => print!("{}", render_tables(tables)),
            Outcome::Schema(tables) => print!("{}", render_schema(tables)),
            Outcome::Described(description) => print!("{}", render_description(description)),
            Outcome::Saved {
                path,
                rows,
                columns,
            } => {
                println!("{} Results saved to: {}", "✅".green(), path.display());
                println!("📊 Exported {} rows with {} columns", rows, columns);
            }
            Outcome::Browse { sql, output } => {
                let title = format!("Query Results ({} rows)", output.rows.len());
                let content = format!(
                    "Query: {}\n\n📊 {}\n{}\n\n{}",
                    sql,
                    title,
                    "=".repeat(title.len() + 4),
                    render_table(output, None)
                );
                if let Err(e) = page(&title, &content).await {
                    warn!(error = %e, "pager failed");
                    eprintln!("{} {}", "❌".red(), format!("error running less: {}", e).red());
                }
            }
        }
    }
}

/// Columns available on stdout, when stdout is a terminal.
fn terminal_width() -> Option<usize> {
    if !std::io::stdout().is_terminal() {
        return None;
    }
    crossterm::terminal::size()
        .ok()
        .map(|(columns, _)| columns as usize)
        .filter(|&columns| columns > 0)
}

/// Pipe `content` through `less -S -R`; print it directly when `less` is missing.
pub async fn page(title: &str, content: &str) -> std::io::Result<()> {
    let child = tokio::process::Command::new("less")
        .args(["-S", "-R"])
        .stdin(Stdio::piped())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("{}", "⚠️  'less' command not found, displaying all content:".yellow());
            print!("{}", content);
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    println!("📖 Opening {} in less (press 'q' to exit)...", title);
    if let Some(mut stdin) = child.stdin.take() {
        // less may quit before reading everything; a broken pipe is fine.
        match stdin.write_all(content.as_bytes()).await {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
            _ => {}
        }
    }
    child.wait().await?;
    println!("{}", "✅ Returned from less viewer".green());
    Ok(())
}

/// Shrink the widest columns until a row fits in `max_width`.
fn fit_widths(widths: &mut [usize], max_width: usize) {
    let separators = 3 * widths.len().saturating_sub(1);
    let budget = max_width.saturating_sub(separators);
    while widths.iter().sum::<usize>() > budget {
        let Some(widest) = (0..widths.len()).max_by_key(|&i| widths[i]) else {
            break;
        };
        if widths[widest] <= MIN_COLUMN_WIDTH {
            break;
        }
        widths[widest] -= 1;
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    if width <= 3 {
        return text.chars().take(width).collect();
    }
    let mut cut: String = text.chars().take(width - 3).collect();
    cut.push_str("...");
    cut
}

/// Column-aligned table with header, separator and row count.
///
/// With `max_width`, wide columns are cut down (ending in `...`) so each
/// line fits.
pub fn render_table(output: &QueryOutput, max_width: Option<usize>) -> String {
    let cell = |value: &Option<String>| value.clone().unwrap_or_else(|| "NULL".to_string());

    let mut widths: Vec<usize> = output.columns.iter().map(|c| c.chars().count()).collect();
    for row in &output.rows {
        for (i, value) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell(value).chars().count());
            }
        }
    }
    if let Some(max_width) = max_width {
        fit_widths(&mut widths, max_width);
    }

    let pad = |text: &str, width: usize| {
        let text = truncate(text, width);
        let fill = width.saturating_sub(text.chars().count());
        format!("{}{}", text, " ".repeat(fill))
    };

    let mut out = String::new();
    let header: Vec<String> = output
        .columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| pad(c, *w))
        .collect();
    out.push_str(&format!("{}\n", header.join(" │ ").trim_end().white().bold()));

    let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    out.push_str(&format!("{}\n", sep.join("─┼─").dimmed()));

    for row in &output.rows {
        let cells: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(i, w)| pad(&row.get(i).map(cell).unwrap_or_default(), *w))
            .collect();
        out.push_str(cells.join(" │ ").trim_end());
        out.push('\n');
    }

    let count = output.rows.len();
    out.push_str(&format!(
        "({} {})\n",
        count.to_string().cyan(),
        if count == 1 { "row" } else { "rows" }
    ));
    out
}

#[derive(Serialize)]
struct JsonResult<'a> {
    columns: &'a [String],
    rows: &'a [Vec<Option<String>>],
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
}

pub fn render_json(output: &QueryOutput) -> String {
    let result = JsonResult {
        columns: &output.columns,
        rows: &output.rows,
        command: output.command_tag.as_deref(),
    };
    serde_json::to_string_pretty(&result).unwrap_or_default()
}

const NO_TABLES: &str = "No tables found in the database.\n";

pub fn render_tables(tables: &[TableInfo]) -> String {
    if tables.is_empty() {
        return NO_TABLES.to_string();
    }
    let mut out = format!("{}\n=================\n", "Tables and Views:".cyan().bold());
    for table in tables {
        out.push_str(&format!(
            "{:<20} {:<18} {}\n",
            table.name, table.kind, table.schema
        ));
    }
    out
}

/// Tables grouped under their schema, in listing order.
pub fn render_schema(tables: &[TableInfo]) -> String {
    if tables.is_empty() {
        return NO_TABLES.to_string();
    }
    let mut out = format!("{}\n========================\n", "Database Schema Overview:".cyan().bold());
    let mut current: Option<&str> = None;
    for table in tables {
        if current != Some(table.schema.as_str()) {
            out.push_str(&format!("\nSchema: {}\n", table.schema.bold()));
            out.push_str(&format!("{}\n", "-".repeat(table.schema.len() + 8)));
            current = Some(&table.schema);
        }
        out.push_str(&format!(
            "  {} ({}, ~{} rows)\n",
            table.name, table.kind, table.estimated_rows
        ));
    }
    out
}

pub fn render_description(desc: &TableDescription) -> String {
    let mut out = format!(
        "{} {} ({})\n",
        "Table:".cyan().bold(),
        desc.table,
        desc.kind
    );
    if let Some(comment) = &desc.comment {
        out.push_str(&format!("Description: {}\n", comment));
    }
    out.push('\n');

    if desc.columns.is_empty() {
        out.push_str("No columns found.\n");
        return out;
    }

    out.push_str("Columns:\n========\n");
    out.push_str(&format!(
        "{:<20} {:<15} {:<8} {:<4} {}\n",
        "Name", "Type", "Nullable", "Key", "Default"
    ));
    out.push_str(&format!("{}\n", "-".repeat(70)));
    for col in &desc.columns {
        out.push_str(&format!(
            "{:<20} {:<15} {:<8} {:<4} {}",
            col.name,
            col.data_type,
            if col.nullable { "YES" } else { "NO" },
            if col.primary_key { "PK" } else { "" },
            col.default.as_deref().unwrap_or("(none)")
        ));
        out.push('\n');
    }

    if !desc.foreign_keys.is_empty() {
        out.push_str("\nForeign Keys:\n=============\n");
        for fk in &desc.foreign_keys {
            out.push_str(&format!(
                "{} -> {}.{}.{}\n",
                fk.column, fk.foreign_schema, fk.foreign_table, fk.foreign_column
            ));
        }
    }
    out
}

pub fn print_banner(masked_uri: &str, server_version: Option<&str>) {
    println!("{}", "🐘 pgshell - interactive PostgreSQL session".cyan().bold());
    match server_version {
        Some(version) => println!("{} {} (server {})", "Connected to".dimmed(), masked_uri, version),
        None => println!("{} {}", "Connected to".dimmed(), masked_uri),
    }
    println!(
        "{}",
        format!(
            "Type {} for help, {} to quit. Ctrl+C cancels a running query.",
            HELP_DIRECTIVE, QUIT_DIRECTIVES[0]
        )
        .dimmed()
    );
    println!();
}

pub fn print_help() {
    let quit = QUIT_DIRECTIVES.join(", ");
    let help = format!("{}, /h", HELP_DIRECTIVE);
    let entries = [
        (help.as_str(), "Show this help"),
        (quit.as_str(), "Exit the session"),
        ("/tables, /t", "List tables and views"),
        ("/schema, /s", "Schema overview"),
        ("/describe <table>, /d", "Describe a table (schema.table allowed)"),
        ("/save [file]", "Save the last result as CSV"),
        ("/browse, /b", "Page through the last result in less"),
        ("Ctrl+C", "Cancel the running statement"),
    ];

    println!("{}", "pgshell commands:".cyan().bold());
    for (command, what) in entries {
        println!("  {:<24} {}", command.yellow(), what);
    }
    println!();
    println!("Anything else is sent to the server as SQL.");
    println!();
}
