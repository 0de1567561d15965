//! Query results.
//!
//! The simple query protocol returns every value in text format.

/// One result row; `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgRow {
    pub columns: Vec<Option<Vec<u8>>>,
}

impl PgRow {
    pub fn new(columns: Vec<Option<Vec<u8>>>) -> Self {
        Self { columns }
    }

    /// Get a column value as String.
    /// Returns None if the value is NULL or invalid UTF-8.
    pub fn get_string(&self, idx: usize) -> Option<String> {
        self.columns
            .get(idx)?
            .as_ref()
            .and_then(|bytes| String::from_utf8(bytes.clone()).ok())
    }

    /// Get a column value as i64.
    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        let bytes = self.columns.get(idx)?.as_ref()?;
        std::str::from_utf8(bytes).ok()?.parse().ok()
    }

    /// Check if a column is NULL.
    pub fn is_null(&self, idx: usize) -> bool {
        self.columns.get(idx).map(|v| v.is_none()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Text rendering of every column, lossy on invalid UTF-8.
    pub fn to_text(&self) -> Vec<Option<String>> {
        self.columns
            .iter()
            .map(|c| c.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()))
            .collect()
    }
}

/// Outcome of one simple-query round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Column names of the last row-returning statement.
    pub columns: Vec<String>,
    pub rows: Vec<PgRow>,
    /// Tag of the last completed statement, e.g. `SELECT 1` or `UPDATE 3`.
    pub command_tag: Option<String>,
    /// NoticeResponse messages received while the statement ran.
    pub notices: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors() {
        let row = PgRow::new(vec![Some(b"42".to_vec()), None, Some(vec![0xff])]);
        assert_eq!(row.get_i64(0), Some(42));
        assert_eq!(row.get_string(0).as_deref(), Some("42"));
        assert!(row.is_null(1));
        assert!(row.is_null(9));
        assert_eq!(row.get_string(2), None);
        assert_eq!(
            row.to_text(),
            vec![Some("42".to_string()), None, Some("\u{fffd}".to_string())]
        );
    }
}
