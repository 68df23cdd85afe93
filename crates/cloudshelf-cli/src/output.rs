//! Table and JSON output formatting for CLI commands.

use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tabled::{Table, Tabled};

use cloudshelf_core::AppError;
use cloudshelf_core::types::{OperationResult, ProgressCallback, TransferProgress};

/// Output format selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// JSON output
    Json,
}

/// Print a list of rows in the selected format
pub fn print_list<T: Serialize + Tabled>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No results found.");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputFormat::Json => print_json(&items),
    }
}

/// Print a single record: `fields` as aligned pairs in table mode, `item`
/// itself in JSON mode.
pub fn print_record<T: Serialize>(item: &T, fields: &[(&str, String)], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            for (key, value) in fields {
                print_kv(key, value);
            }
        }
        OutputFormat::Json => print_json(item),
    }
}

/// `{success: true, data}` envelope as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(item: &T) {
    emit(&OperationResult::ok(item));
}

/// Report a failed command: an envelope on stdout in JSON mode, a message
/// on stderr otherwise.
pub fn print_failure(err: &AppError, format: OutputFormat) {
    match format {
        OutputFormat::Table => print_error(&err.user_message()),
        OutputFormat::Json => emit(&OperationResult::<()>::err(err)),
    }
}

fn emit<T: Serialize>(envelope: &OperationResult<T>) {
    let json = serde_json::to_string_pretty(envelope).unwrap_or_else(|_| "{}".to_string());
    println!("{json}");
}

/// Print a success message
pub fn print_success(msg: &str) {
    println!("✓ {msg}");
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    eprintln!("⚠ {msg}");
}

/// Print an error message
pub fn print_error(msg: &str) {
    eprintln!("✗ {msg}");
}

/// Print a key-value pair
pub fn print_kv(key: &str, value: &str) {
    println!("  {:<16} {}", format!("{key}:"), value);
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Timestamp column value.
pub fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Progress callback drawing a single updating line on stderr.
pub fn progress_line(label: String) -> ProgressCallback {
    Arc::new(move |p: TransferProgress| {
        let speed = p
            .speed
            .map(|s| format!("  {}/s", format_bytes(s as u64)))
            .unwrap_or_default();
        let mut stderr = std::io::stderr().lock();
        let _ = write!(
            stderr,
            "\r{label}  {:>5.1}%  {} / {}{speed}   ",
            p.percent,
            format_bytes(p.transferred),
            format_bytes(p.total)
        );
        if p.is_complete() {
            let _ = writeln!(stderr);
        }
        let _ = stderr.flush();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_envelope_shape() {
        let ok = serde_json::to_value(OperationResult::ok(&vec![1, 2])).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"][1], 2);
        assert!(ok.get("error").is_none());

        let err = AppError::not_found("Object 'a.txt' not found");
        let failed = serde_json::to_value(OperationResult::<()>::err(&err)).unwrap();
        assert_eq!(failed["success"], false);
        assert_eq!(failed["error"]["code"], "NOT_FOUND");
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(None), "-");
        let at = DateTime::parse_from_rfc3339("2024-03-01T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_time(Some(at)), "2024-03-01 08:30:00");
    }
}
