//! Request orchestration: generate or accept SQL, gate it, then either return it, run one
//! page of it, or stream all of it as CSV.

use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::ai::{CompletionClient, PromptComposer};
use crate::config::QuerySettings;
use crate::db::{
    ColumnSummary, CompactSchema, CsvFormat, PageWindow, QueryExecutor, Record, RowSource,
    SchemaSnapshot, SchemaSource,
};
use crate::error::{Error, Result};
use crate::sql::{remove_limit_offset, SqlValidator};
use crate::storage::{AuditRecord, AuditSink};

/// Audit prompt recorded for exports.
pub const EXPORT_PROMPT: &str = "CSV Export";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub limit: Option<i64>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub execute: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub check_schema: bool,
    #[serde(default)]
    pub error_context: Option<ErrorContext>,
}

/// Sent back by a client after a failed attempt so the next one can be corrected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(default)]
    pub original_prompt: Option<String>,
    #[serde(default)]
    pub failed_sql: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// 1-based, incremented by the client on every resubmission.
    #[serde(default, deserialize_with = "lenient_int")]
    pub attempt: Option<i64>,
}

/// Integers as form-style clients send them: numbers (fractions truncate) or numeric
/// strings. Anything else counts as absent.
fn lenient_int<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = |text: &str| {
        let text = text.trim();
        text.parse::<i64>()
            .ok()
            .or_else(|| text.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
    };
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => number(&s),
        _ => None,
    })
}

/// Flags from booleans, 0/1 or "true"/"1"-style strings. Null and anything else is false.
fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        _ => false,
    })
}

struct Correction<'a> {
    failed_sql: &'a str,
    error: &'a str,
    original_prompt: Option<&'a str>,
    attempt: Option<i64>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ErrorContext {
    /// Usable only when both the failed statement and its error are present.
    fn correction(&self) -> Option<Correction<'_>> {
        Some(Correction {
            failed_sql: non_blank(&self.failed_sql)?,
            error: non_blank(&self.error)?,
            original_prompt: non_blank(&self.original_prompt),
            attempt: self.attempt,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub success: bool,
    pub sql: String,
    pub executed: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<i64>,
}

fn default_delimiter() -> String {
    ";".to_string()
}

fn default_enclosure() -> String {
    "\"".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_enclosure")]
    pub enclosure: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub check_schema: bool,
}

impl ExportRequest {
    pub fn for_sql(sql: impl Into<String>) -> Self {
        Self {
            sql: Some(sql.into()),
            delimiter: default_delimiter(),
            enclosure: default_enclosure(),
            check_schema: false,
        }
    }
}

pub struct CsvExport {
    pub filename: String,
    pub lines: BoxStream<'static, Result<String>>,
}

pub fn export_filename(at: chrono::NaiveDateTime) -> String {
    format!("query-export-{}.csv", at.format("%Y%m%d-%H%M%S"))
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SchemaView {
    Full(SchemaSnapshot),
    Compact(CompactSchema),
}

pub struct QueryService {
    schema: Arc<dyn SchemaSource>,
    composer: PromptComposer,
    completion: Arc<dyn CompletionClient>,
    validator: SqlValidator,
    executor: QueryExecutor,
    audit: Option<Arc<dyn AuditSink>>,
    settings: QuerySettings,
}

impl QueryService {
    pub fn new(
        schema: Arc<dyn SchemaSource>,
        completion: Arc<dyn CompletionClient>,
        rows: Arc<dyn RowSource>,
        audit: Option<Arc<dyn AuditSink>>,
        settings: QuerySettings,
        locale: &str,
    ) -> Self {
        Self {
            composer: PromptComposer::new(schema.clone(), locale),
            validator: SqlValidator::new(schema.clone()),
            executor: QueryExecutor::new(rows, settings.max_page_size),
            schema,
            completion,
            audit,
            settings,
        }
    }

    /// Generate/Execute.
    pub async fn run_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let prompt = non_blank(&request.prompt).unwrap_or("");
        let correction = request
            .error_context
            .as_ref()
            .and_then(ErrorContext::correction);
        let audit_prompt = match (prompt, &correction) {
            ("", Some(c)) => c.original_prompt.unwrap_or(""),
            (p, _) => p,
        }
        .to_string();

        let sql = match non_blank(&request.sql) {
            Some(sql) => sql.to_string(),
            None => {
                if prompt.is_empty() && correction.is_none() {
                    return Err(Error::validation("Prompt or SQL is required"));
                }
                self.generate(prompt, correction).await?
            }
        };

        let window = PageWindow::clamp(
            request.page.unwrap_or(1),
            request
                .limit
                .unwrap_or_else(|| i64::from(self.settings.default_page_size)),
            self.executor.max_page_size(),
        );

        let outcome = self.validator.validate(&sql, request.check_schema).await?;
        if !outcome.valid {
            let message = outcome.error.unwrap_or_default();
            warn!(error = %message, %sql, "query rejected");
            self.audit(&audit_prompt, &sql, false, None).await;
            return Err(Error::rejected_sql(message, sql));
        }
        let sql = outcome.sanitized_sql;

        if !request.execute {
            self.audit(&audit_prompt, &sql, false, None).await;
            return Ok(QueryResponse {
                success: true,
                sql,
                executed: false,
                columns: Vec::new(),
                rows: Vec::new(),
                total: 0,
                page: window.page,
                limit: window.limit,
                total_pages: None,
            });
        }

        let clean_sql = remove_limit_offset(&sql);
        let result = self
            .executor
            .execute(&clean_sql, window.page, window.limit, request.sort.as_deref())
            .await?;
        info!(
            total = result.total,
            page = result.page,
            rows = result.rows.len(),
            "query executed"
        );
        self.audit(&audit_prompt, &sql, true, Some(result.total)).await;

        Ok(QueryResponse {
            success: true,
            sql,
            executed: true,
            columns: result.columns,
            rows: result.rows,
            total: result.total,
            page: result.page,
            limit: result.limit,
            total_pages: Some(result.total_pages),
        })
    }

    async fn generate(&self, prompt: &str, correction: Option<Correction<'_>>) -> Result<String> {
        let use_compact = self.settings.use_compact_schema;
        let max_tables = self.settings.max_prompt_tables;

        let messages = match correction {
            Some(c) => {
                let limit = self.settings.max_correction_attempts;
                if limit > 0 && c.attempt.is_some_and(|attempt| attempt > i64::from(limit)) {
                    return Err(Error::validation(format!(
                        "Correction attempt limit reached ({})",
                        limit
                    )));
                }
                let original = c.original_prompt.or(Some(prompt).filter(|p| !p.is_empty()));
                info!(attempt = c.attempt, "requesting corrected SQL");
                self.composer
                    .build_error_correction_messages(
                        c.failed_sql,
                        c.error,
                        original,
                        use_compact,
                        max_tables,
                    )
                    .await?
            }
            None => {
                self.composer
                    .build_messages(prompt, use_compact, max_tables)
                    .await?
            }
        };

        self.completion.generate_sql(&messages).await
    }

    /// Export: validate pre-supplied SQL and stream every row as CSV.
    pub async fn export(&self, request: ExportRequest) -> Result<CsvExport> {
        let sql = non_blank(&request.sql).ok_or_else(|| Error::validation("SQL is required"))?;
        let format = CsvFormat::new(&request.delimiter, &request.enclosure)?;

        let outcome = self.validator.validate(sql, request.check_schema).await?;
        if !outcome.valid {
            let message = outcome.error.unwrap_or_default();
            warn!(error = %message, %sql, "export rejected");
            return Err(Error::rejected_sql(message, sql));
        }

        let clean_sql = remove_limit_offset(&outcome.sanitized_sql);
        self.audit(EXPORT_PROMPT, &outcome.sanitized_sql, true, None)
            .await;

        let lines = self.executor.execute_as_csv(&clean_sql, format).await?;
        Ok(CsvExport {
            filename: export_filename(chrono::Local::now().naive_local()),
            lines,
        })
    }

    /// Full snapshot, or the compact view bounded by `max_tables` (configured default
    /// when absent, 0 = all).
    pub async fn schema(&self, compact: bool, max_tables: Option<usize>) -> Result<SchemaView> {
        if compact {
            let max_tables = max_tables.unwrap_or(self.settings.max_prompt_tables);
            Ok(SchemaView::Compact(
                self.schema.compact_schema(max_tables).await?,
            ))
        } else {
            Ok(SchemaView::Full(self.schema.full_schema().await?))
        }
    }

    /// `None` when the table does not exist.
    pub async fn table_columns(&self, table: &str) -> Result<Option<Vec<ColumnSummary>>> {
        if !self.schema.table_exists(table).await? {
            return Ok(None);
        }
        Ok(Some(self.schema.columns_of(table).await?))
    }

    async fn audit(&self, prompt: &str, sql: &str, executed: bool, row_count: Option<i64>) {
        let Some(sink) = &self.audit else {
            return;
        };
        let entry = AuditRecord {
            prompt: prompt.to_string(),
            sql: sql.to_string(),
            executed,
            row_count,
        };
        if let Err(e) = sink.record(entry).await {
            warn!(error = %e, "failed to write audit log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_filename_is_timestamped() {
        let at = chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();
        assert_eq!(export_filename(at), "query-export-20240309-070501.csv");
    }

    #[test]
    fn request_defaults() {
        let request: QueryRequest = serde_json::from_str(r#"{"prompt": "orders"}"#).unwrap();
        assert!(!request.execute);
        assert!(!request.check_schema);
        assert_eq!(request.page, None);

        let export: ExportRequest = serde_json::from_str(r#"{"sql": "SELECT 1"}"#).unwrap();
        assert_eq!(export.delimiter, ";");
        assert_eq!(export.enclosure, "\"");
    }

    #[test]
    fn error_context_needs_sql_and_error() {
        let ctx: ErrorContext =
            serde_json::from_str(r#"{"failedSql": "SELECT x", "error": "  "}"#).unwrap();
        assert!(ctx.correction().is_none());

        let ctx: ErrorContext = serde_json::from_str(
            r#"{"failedSql": "SELECT x", "error": "bad column", "attempt": 2}"#,
        )
        .unwrap();
        let correction = ctx.correction().unwrap();
        assert_eq!(correction.failed_sql, "SELECT x");
        assert_eq!(correction.attempt, Some(2));
        assert_eq!(correction.original_prompt, None);
    }

    #[test]
    fn loosely_typed_fields_are_coerced() {
        let request: QueryRequest = serde_json::from_str(
            r#"{"page": "2", "limit": 10.5, "execute": null, "checkSchema": "yes"}"#,
        )
        .unwrap();
        assert_eq!(request.page, Some(2));
        assert_eq!(request.limit, Some(10));
        assert!(!request.execute);
        assert!(request.check_schema);

        let request: QueryRequest = serde_json::from_str(
            r#"{"page": " 3.9 ", "limit": "lots", "execute": 1, "checkSchema": 0}"#,
        )
        .unwrap();
        assert_eq!(request.page, Some(3));
        assert_eq!(request.limit, None);
        assert!(request.execute);
        assert!(!request.check_schema);

        let ctx: ErrorContext =
            serde_json::from_str(r#"{"failedSql": "SELECT x", "error": "e", "attempt": "4"}"#)
                .unwrap();
        assert_eq!(ctx.attempt, Some(4));

        let export: ExportRequest =
            serde_json::from_str(r#"{"sql": "SELECT 1", "checkSchema": "true"}"#).unwrap();
        assert!(export.check_schema);
    }

    #[test]
    fn non_executed_response_omits_total_pages() {
        let response = QueryResponse {
            success: true,
            sql: "SELECT 1".into(),
            executed: false,
            columns: vec![],
            rows: vec![],
            total: 0,
            page: 1,
            limit: 25,
            total_pages: None,
        };
        let json = serde_json::to_value(response).unwrap();
        assert!(json.get("totalPages").is_none());
        assert_eq!(json["executed"], false);
    }
}
