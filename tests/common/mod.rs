#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use sqlscout::ai::{CompletionClient, PromptMessage};
use sqlscout::commands::QueryService;
use sqlscout::config::QuerySettings;
use sqlscout::db::{
    ColumnSchema, ColumnSummary, ForeignKey, Record, RecordStream, RowSource, SchemaSnapshot,
    SchemaSource, TableSchema,
};
use sqlscout::error::UpstreamError;
use sqlscout::storage::{AuditError, AuditRecord, AuditSink};
use sqlscout::{Error, Result};

fn column(name: &str, data_type: &str, nullable: bool) -> ColumnSchema {
    ColumnSchema {
        name: name.into(),
        data_type: data_type.into(),
        length: None,
        nullable,
        default: None,
        auto_increment: name == "id",
        comment: None,
    }
}

fn foreign_key(local: &str, table: &str) -> ForeignKey {
    ForeignKey {
        name: format!("fk_{}", local),
        local_columns: vec![local.into()],
        foreign_table: table.into(),
        foreign_columns: vec!["id".into()],
        on_update: "NO ACTION".into(),
        on_delete: "CASCADE".into(),
    }
}

fn table(name: &str, columns: Vec<ColumnSchema>, foreign_keys: Vec<ForeignKey>) -> TableSchema {
    TableSchema {
        name: name.into(),
        columns,
        primary_key: vec!["id".into()],
        foreign_keys,
        indexes: vec![],
    }
}

/// Fixed three-table shop schema in namespace `public`.
pub struct StaticSchema {
    snapshot: SchemaSnapshot,
    broken: bool,
}

impl StaticSchema {
    pub fn shop() -> Self {
        Self {
            snapshot: SchemaSnapshot {
                database: "shop".into(),
                tables: vec![
                    table(
                        "customer",
                        vec![
                            column("id", "integer", false),
                            column("name", "text", false),
                            column("email", "text", true),
                        ],
                        vec![],
                    ),
                    table(
                        "orders",
                        vec![
                            column("id", "integer", false),
                            column("customer_id", "integer", false),
                            column("product_id", "integer", false),
                            column("total", "numeric", false),
                        ],
                        vec![
                            foreign_key("customer_id", "customer"),
                            foreign_key("product_id", "product"),
                        ],
                    ),
                    table(
                        "product",
                        vec![
                            column("id", "integer", false),
                            column("name", "text", false),
                            column("stock", "integer", false),
                        ],
                        vec![],
                    ),
                ],
            },
            broken: false,
        }
    }

    /// Every read fails as if the catalog were unreachable.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::shop()
        }
    }

    fn check(&self) -> Result<()> {
        if self.broken {
            return Err(Error::Schema("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaSource for StaticSchema {
    fn namespace(&self) -> &str {
        "public"
    }

    async fn full_schema(&self) -> Result<SchemaSnapshot> {
        self.check()?;
        Ok(self.snapshot.clone())
    }

    async fn all_table_names(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.snapshot.tables.iter().map(|t| t.name.clone()).collect())
    }

    async fn columns_of(&self, table: &str) -> Result<Vec<ColumnSummary>> {
        self.check()?;
        Ok(self
            .snapshot
            .tables
            .iter()
            .filter(|t| t.name == table)
            .flat_map(|t| &t.columns)
            .map(|c| ColumnSummary {
                name: c.name.clone(),
                data_type: c.data_type.clone(),
                nullable: c.nullable,
            })
            .collect())
    }
}

enum Reply {
    Sql(String),
    Status(u16, String),
}

/// Hands out canned completions in order and remembers every prompt it was given.
#[derive(Default)]
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Reply>>,
    pub received: Mutex<Vec<Vec<PromptMessage>>>,
}

impl ScriptedCompletion {
    pub fn replying(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| Reply::Sql(r.to_string())).collect()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(status: u16, body: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from([Reply::Status(status, body.to_string())])),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn last_user_message(&self) -> String {
        let received = self.received.lock().unwrap();
        received
            .last()
            .and_then(|messages| messages.last())
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn generate_sql(&self, messages: &[PromptMessage]) -> Result<String> {
        self.received.lock().unwrap().push(messages.to_vec());
        match self.replies.lock().unwrap().pop_front() {
            Some(Reply::Sql(sql)) => Ok(sql),
            Some(Reply::Status(status, body)) => Err(UpstreamError::Status { status, body }.into()),
            None => Err(UpstreamError::Malformed {
                body: "no scripted reply left".into(),
            }
            .into()),
        }
    }
}

/// In-memory result set. Understands the count wrapper and the trailing
/// `LIMIT n OFFSET m` the executor appends.
#[derive(Default)]
pub struct MemoryRows {
    rows: Vec<Record>,
    failure: Option<String>,
    pub statements: Mutex<Vec<String>>,
}

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => panic!("record must be a JSON object"),
    }
}

impl MemoryRows {
    pub fn new(rows: Vec<Record>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// `count` orders rows with ids 1..=count.
    pub fn orders(count: i64) -> Self {
        Self::new(
            (1..=count)
                .map(|id| record(json!({ "id": id, "customer_id": id % 7, "total": "9.50" })))
                .collect(),
        )
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    fn log(&self, sql: &str) -> Result<()> {
        self.statements.lock().unwrap().push(sql.to_string());
        match &self.failure {
            Some(message) => Err(Error::Execution(message.clone())),
            None => Ok(()),
        }
    }
}

fn page_bounds(sql: &str) -> Option<(usize, usize)> {
    let tail = &sql[sql.rfind(" LIMIT ")? + " LIMIT ".len()..];
    let mut parts = tail.split(" OFFSET ");
    let limit = parts.next()?.trim().parse().ok()?;
    let offset = parts.next()?.trim().parse().ok()?;
    Some((limit, offset))
}

#[async_trait]
impl RowSource for MemoryRows {
    async fn fetch_count(&self, sql: &str) -> Result<i64> {
        self.log(sql)?;
        assert!(
            sql.starts_with("SELECT COUNT(*) FROM ("),
            "unexpected count query: {}",
            sql
        );
        Ok(self.rows.len() as i64)
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<Record>> {
        self.log(sql)?;
        let (limit, offset) = page_bounds(sql).unwrap_or((usize::MAX, 0));
        Ok(self.rows.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn fetch_stream(&self, sql: &str) -> Result<RecordStream> {
        self.log(sql)?;
        Ok(stream::iter(self.rows.clone().into_iter().map(Ok)).boxed())
    }
}

/// Collects audit records; optionally fails every write.
#[derive(Default)]
pub struct RecordingAudit {
    pub records: Mutex<Vec<AuditRecord>>,
    fail: bool,
}

impl RecordingAudit {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn entries(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, entry: AuditRecord) -> std::result::Result<(), AuditError> {
        if self.fail {
            return Err(AuditError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.records.lock().unwrap().push(entry);
        Ok(())
    }
}

pub struct Harness {
    pub service: QueryService,
    pub completion: Arc<ScriptedCompletion>,
    pub rows: Arc<MemoryRows>,
    pub audit: Arc<RecordingAudit>,
}

pub fn harness(completion: ScriptedCompletion, rows: MemoryRows) -> Harness {
    harness_with(
        StaticSchema::shop(),
        completion,
        rows,
        RecordingAudit::default(),
        QuerySettings::default(),
    )
}

pub fn harness_with(
    schema: StaticSchema,
    completion: ScriptedCompletion,
    rows: MemoryRows,
    audit: RecordingAudit,
    settings: QuerySettings,
) -> Harness {
    let completion = Arc::new(completion);
    let rows = Arc::new(rows);
    let audit = Arc::new(audit);
    let service = QueryService::new(
        Arc::new(schema),
        completion.clone(),
        rows.clone(),
        Some(audit.clone()),
        settings,
        "en_US",
    );
    Harness {
        service,
        completion,
        rows,
        audit,
    }
}
