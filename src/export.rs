//! CSV export of the last result set (`/save`).

use crate::error::{SessionError, SessionResult};
use crate::handle::QueryOutput;
use chrono::{DateTime, Local};
use std::path::{Component, Path, PathBuf};

/// `pgshell_results_<timestamp>.csv`
pub fn default_file_name(now: DateTime<Local>) -> String {
    format!("pgshell_results_{}.csv", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Where `/save [file]` writes. Adds `.csv` when missing; refuses `..`.
pub fn resolve_path(file: Option<&str>) -> SessionResult<PathBuf> {
    let mut name = match file {
        Some(file) => file.to_string(),
        None => default_file_name(Local::now()),
    };
    if !name.to_lowercase().ends_with(".csv") {
        name.push_str(".csv");
    }

    let path = PathBuf::from(name);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(SessionError::Export(
            "path traversal detected: file name cannot contain '..'".to_string(),
        ));
    }
    Ok(path)
}

/// Header plus one line per row. NULL becomes an empty field.
pub fn to_csv(output: &QueryOutput) -> String {
    let mut csv = String::new();
    write_row(&mut csv, output.columns.iter().map(String::as_str));
    for row in &output.rows {
        write_row(&mut csv, row.iter().map(|v| v.as_deref().unwrap_or("")));
    }
    csv
}

fn write_row<'a>(csv: &mut String, values: impl Iterator<Item = &'a str>) {
    let line: Vec<String> = values.map(escape_csv_value).collect();
    csv.push_str(&line.join(","));
    csv.push('\n');
}

fn escape_csv_value(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Write `output` as CSV and return the absolute path written.
pub async fn save_csv(output: &QueryOutput, file: Option<&str>) -> SessionResult<PathBuf> {
    let path = resolve_path(file)?;
    tokio::fs::write(&path, to_csv(output)).await?;
    Ok(absolute(&path))
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_file_name() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(default_file_name(now), "pgshell_results_2024-03-09_14-05-07.csv");
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path(Some("out")).unwrap(), PathBuf::from("out.csv"));
        assert_eq!(resolve_path(Some("Out.CSV")).unwrap(), PathBuf::from("Out.CSV"));
        assert_eq!(
            resolve_path(Some("/tmp/report")).unwrap(),
            PathBuf::from("/tmp/report.csv")
        );
        assert!(resolve_path(None).unwrap().to_string_lossy().starts_with("pgshell_results_"));

        assert!(matches!(
            resolve_path(Some("../etc/passwd")),
            Err(SessionError::Export(_))
        ));
        assert!(matches!(
            resolve_path(Some("reports/../../x.csv")),
            Err(SessionError::Export(_))
        ));
    }

    #[test]
    fn test_to_csv_escapes_and_nulls() {
        let output = QueryOutput {
            columns: vec!["id".to_string(), "note".to_string()],
            rows: vec![
                vec![Some("1".to_string()), Some("plain".to_string())],
                vec![Some("2".to_string()), Some("a, \"quoted\"\nline".to_string())],
                vec![Some("3".to_string()), None],
            ],
            ..Default::default()
        };
        assert_eq!(
            to_csv(&output),
            "id,note\n1,plain\n2,\"a, \"\"quoted\"\"\nline\"\n3,\n"
        );
    }
}
