/// Results Grid Module for termsql
///
/// Renders statement results as plain text for the terminal, and derives
/// the row limit used for execution from the space available to show rows.
use crate::core::db::{StatementResult, StatementType};
use crate::core::ClientError;

/// Header line, underline and footer line.
const CHROME_LINES: usize = 3;

/// The visible area results are rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub height: usize,
}

impl Viewport {
    pub fn new(height: usize) -> Self {
        Viewport { height }
    }

    /// A viewport tall enough to show `rows` rows.
    pub fn with_rows(rows: usize) -> Self {
        Viewport {
            height: rows + CHROME_LINES,
        }
    }

    /// Number of rows that fit once the header and footer are drawn.
    pub fn row_limit(&self) -> usize {
        self.height.saturating_sub(CHROME_LINES).max(1)
    }
}

/// Represents the entire grid structure.
#[derive(Debug, Clone, Default)]
pub struct ResultsGrid {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub truncated: bool,
}

impl ResultsGrid {
    /// Creates a new, empty ResultsGrid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a grid from a row-set result; `None` for update counts.
    pub fn from_result(result: &StatementResult) -> Option<Self> {
        match result {
            StatementResult::Rows {
                columns,
                rows,
                truncated,
            } => Some(ResultsGrid {
                headers: columns.clone(),
                rows: rows
                    .iter()
                    .map(|row| row.values().map(|v| v.to_string()).collect())
                    .collect(),
                truncated: *truncated,
            }),
            StatementResult::UpdateCount(_) => None,
        }
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                let width = cell.chars().count();
                match widths.get_mut(i) {
                    Some(w) => *w = (*w).max(width),
                    None => widths.push(width),
                }
            }
        }
        widths
    }

    /// Renders the grid with aligned columns and a row-count footer.
    pub fn render(&self) -> String {
        let widths = self.widths();
        let line = |cells: &[String]| -> String {
            cells
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
                .collect::<Vec<_>>()
                .join(" | ")
                .trim_end()
                .to_string()
        };

        let mut output = String::new();
        if !self.headers.is_empty() {
            output.push_str(&line(&self.headers));
            output.push('\n');
            let underline: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
            output.push_str(&underline.join("-+-"));
            output.push('\n');
        }
        for row in &self.rows {
            output.push_str(&line(row));
            output.push('\n');
        }
        if self.truncated {
            output.push_str(&format!("({} rows shown, more available)\n", self.rows.len()));
        } else {
            output.push_str(&format!("({} rows)\n", self.rows.len()));
        }
        output
    }
}

/// Text shown for one statement result.
pub fn render_result(sql: &str, result: &StatementResult) -> String {
    match ResultsGrid::from_result(result) {
        Some(grid) => grid.render(),
        None => {
            let StatementResult::UpdateCount(count) = result else {
                return String::new();
            };
            match (StatementType::from_sql(sql), *count) {
                (StatementType::Insert | StatementType::Update | StatementType::Delete, n)
                    if n >= 0 =>
                {
                    format!("{} row(s) affected\n", n)
                }
                (_, n) if n > 0 => format!("Statement executed, {} row(s) affected\n", n),
                _ => "Statement executed\n".to_string(),
            }
        }
    }
}

/// Text shown for a failure: the root message plus the vendor code when the
/// driver supplied one.
pub fn render_error(err: &ClientError) -> String {
    match err {
        ClientError::Connection(driver) => match driver.vendor_code {
            Some(code) => format!("Error {}: {}", code, driver.message),
            None => format!("Error: {}", driver.message),
        },
        ClientError::Interrupted => "Interrupted".to_string(),
        other => format!("Error: {}", other),
    }
}
