use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::db::query::{Record, RowSource};
use crate::error::{Error, Result};
use crate::sql::{strip_order_by, SortOverride};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

/// A page request after clamping: `page >= 1`, `1 <= limit <= max_page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub page: i64,
    pub limit: i64,
}

impl PageWindow {
    pub fn clamp(page: i64, limit: i64, max_page_size: i64) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, max_page_size.max(1)),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

pub fn total_pages(total: i64, limit: i64) -> i64 {
    if total <= 0 || limit <= 0 {
        0
    } else {
        (total + limit - 1) / limit
    }
}

pub fn count_sql(sql: &str) -> String {
    format!("SELECT COUNT(*) FROM ({}) AS count_wrapper", sql)
}

pub fn paginated_sql(sql: &str, window: PageWindow, sort: Option<&SortOverride>) -> String {
    let base = match sort {
        Some(sort) => format!("{} ORDER BY {}", strip_order_by(sql), sort.as_sql()),
        None => sql.to_string(),
    };
    format!("{} LIMIT {} OFFSET {}", base, window.limit, window.offset())
}

/// Delimiter and enclosure for CSV export, each a single ASCII byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvFormat {
    pub delimiter: u8,
    pub enclosure: u8,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            delimiter: b';',
            enclosure: b'"',
        }
    }
}

fn single_ascii(value: &str, what: &str) -> Result<u8> {
    match value.as_bytes() {
        [b] if b.is_ascii() && !matches!(*b, b'\n' | b'\r') => Ok(*b),
        _ => Err(Error::validation(format!(
            "{} must be a single ASCII character",
            what
        ))),
    }
}

impl CsvFormat {
    pub fn new(delimiter: &str, enclosure: &str) -> Result<Self> {
        let format = Self {
            delimiter: single_ascii(delimiter, "Delimiter")?,
            enclosure: single_ascii(enclosure, "Enclosure")?,
        };
        if format.delimiter == format.enclosure {
            return Err(Error::validation(
                "Delimiter and enclosure must differ",
            ));
        }
        Ok(format)
    }
}

/// Cell text for CSV output.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "1".into(),
        Value::Bool(false) => "0".into(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One CSV line, `\n`-terminated. A lone empty field is written as a blank line
/// rather than the `""` the csv writer would emit for it.
pub fn encode_line<I, T>(format: CsvFormat, fields: I) -> Result<String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let fields: Vec<T> = fields.into_iter().collect();
    if let [only] = fields.as_slice() {
        if only.as_ref().is_empty() {
            return Ok("\n".to_string());
        }
    }
    let mut writer = csv::WriterBuilder::new()
        .delimiter(format.delimiter)
        .quote(format.enclosure)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(fields)
        .map_err(|e| Error::Execution(e.to_string()))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Execution(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| Error::Execution(e.to_string()))
}

fn csv_lines(format: CsvFormat, record: &Record, with_header: bool) -> Vec<Result<String>> {
    let mut lines = Vec::with_capacity(2);
    if with_header {
        lines.push(encode_line(format, record.keys()));
    }
    lines.push(encode_line(format, record.values().map(cell_text)));
    lines
}

pub struct QueryExecutor {
    rows: Arc<dyn RowSource>,
    max_page_size: i64,
}

impl QueryExecutor {
    pub fn new(rows: Arc<dyn RowSource>, max_page_size: u32) -> Self {
        Self {
            rows,
            max_page_size: i64::from(max_page_size),
        }
    }

    pub fn max_page_size(&self) -> i64 {
        self.max_page_size
    }

    /// Count, then fetch one page. Both round trips run the same inner statement.
    pub async fn execute(
        &self,
        sql: &str,
        page: i64,
        limit: i64,
        sort: Option<&str>,
    ) -> Result<ExecutionResult> {
        let window = PageWindow::clamp(page, limit, self.max_page_size);
        let sort = match sort {
            Some(sort) => SortOverride::parse(sort)?,
            None => None,
        };

        let total = self.rows.fetch_count(&count_sql(sql)).await?;
        let paged = paginated_sql(sql, window, sort.as_ref());
        debug!(
            page = window.page,
            limit = window.limit,
            total,
            sql = %paged,
            "fetching page"
        );
        let rows = self.rows.fetch_all(&paged).await?;

        let columns = rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();

        Ok(ExecutionResult {
            columns,
            rows,
            total,
            page: window.page,
            limit: window.limit,
            total_pages: total_pages(total, window.limit),
        })
    }

    /// Stream the whole result as CSV lines: a header from the first row's columns, then
    /// one line per row. No rows means no output at all.
    pub async fn execute_as_csv(
        &self,
        sql: &str,
        format: CsvFormat,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let records = self.rows.fetch_stream(sql).await?;
        let mut header_written = false;

        Ok(records
            .flat_map(move |record| {
                let lines = match record {
                    Ok(record) => {
                        let with_header = !header_written;
                        header_written = true;
                        csv_lines(format, &record, with_header)
                    }
                    Err(e) => vec![Err(e)],
                };
                stream::iter(lines)
            })
            .boxed())
    }
}
