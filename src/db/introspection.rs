use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_postgres::Client;

use crate::db::connection::ConnectionManager;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    pub database: String,
    pub tables: Vec<TableSchema>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexSchema>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub length: Option<i32>,
    pub nullable: bool,
    pub default: Option<String>,
    pub auto_increment: bool,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub name: String,
    pub local_columns: Vec<String>,
    pub foreign_table: String,
    pub foreign_columns: Vec<String>,
    pub on_update: String,
    pub on_delete: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Size-bounded view of a snapshot, used to keep prompts small.
#[derive(Debug, Clone, Serialize)]
pub struct CompactSchema {
    pub database: String,
    pub tables: Vec<CompactTable>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactTable {
    pub name: String,
    pub columns: Vec<CompactColumn>,
    #[serde(rename = "pk")]
    pub primary_key: Vec<String>,
    #[serde(rename = "fks")]
    pub foreign_keys: Vec<CompactForeignKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactForeignKey {
    pub from: Vec<String>,
    pub to: String,
    #[serde(rename = "toCols")]
    pub to_columns: Vec<String>,
}

/// Column summary returned for a single table.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

impl SchemaSnapshot {
    /// Keep the `max_tables` most foreign-key-connected tables (0 = all). Ties keep
    /// enumeration order.
    pub fn compact(&self, max_tables: usize) -> CompactSchema {
        let mut ranked: Vec<&TableSchema> = self.tables.iter().collect();
        ranked.sort_by(|a, b| b.foreign_keys.len().cmp(&a.foreign_keys.len()));
        if max_tables > 0 {
            ranked.truncate(max_tables);
        }

        CompactSchema {
            database: self.database.clone(),
            tables: ranked
                .into_iter()
                .map(|table| CompactTable {
                    name: table.name.clone(),
                    columns: table
                        .columns
                        .iter()
                        .map(|c| CompactColumn {
                            name: c.name.clone(),
                            data_type: c.data_type.clone(),
                            nullable: c.nullable,
                        })
                        .collect(),
                    primary_key: table.primary_key.clone(),
                    foreign_keys: table
                        .foreign_keys
                        .iter()
                        .map(|fk| CompactForeignKey {
                            from: fk.local_columns.clone(),
                            to: fk.foreign_table.clone(),
                            to_columns: fk.foreign_columns.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Keywords PostgreSQL refuses as bare table or column names.
const RESERVED_WORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
    "authorization", "binary", "both", "case", "cast", "check", "collate", "collation",
    "column", "concurrently", "constraint", "create", "cross", "current_catalog",
    "current_date", "current_role", "current_schema", "current_time", "current_timestamp",
    "current_user", "default", "deferrable", "desc", "distinct", "do", "else", "end",
    "except", "false", "fetch", "for", "foreign", "freeze", "from", "full", "grant",
    "group", "having", "ilike", "in", "initially", "inner", "intersect", "into", "is",
    "isnull", "join", "lateral", "leading", "left", "like", "limit", "localtime",
    "localtimestamp", "natural", "not", "notnull", "null", "offset", "on", "only", "or",
    "order", "outer", "overlaps", "placing", "primary", "references", "returning",
    "right", "select", "session_user", "similar", "some", "symmetric", "system_user",
    "table", "tablesample", "then", "to", "trailing", "true", "union", "unique", "user",
    "using", "variadic", "verbose", "when", "where", "window", "with",
];

/// `name` as it must be written in SQL: bare when it is a plain lower-case identifier,
/// double-quoted otherwise.
pub fn quote_ident(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$');
    if plain && !RESERVED_WORDS.contains(&name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

impl CompactSchema {
    pub fn to_ddl_summary(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!("CREATE TABLE {} (\n", quote_ident(&table.name)));

            let mut lines: Vec<String> = table
                .columns
                .iter()
                .map(|col| {
                    let mut parts = vec![format!("  {} {}", quote_ident(&col.name), col.data_type)];
                    if !col.nullable {
                        parts.push("NOT NULL".into());
                    }
                    parts.join(" ")
                })
                .collect();
            if !table.primary_key.is_empty() {
                lines.push(format!("  PRIMARY KEY ({})", quote_list(&table.primary_key)));
            }
            for fk in &table.foreign_keys {
                lines.push(format!(
                    "  FOREIGN KEY ({}) REFERENCES {} ({})",
                    quote_list(&fk.from),
                    quote_ident(&fk.to),
                    quote_list(&fk.to_columns)
                ));
            }

            out.push_str(&lines.join(",\n"));
            out.push_str("\n);\n\n");
        }
        out
    }
}

/// Live schema metadata. Every call reads the catalog again; nothing is cached.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Schema namespace the tables live in; qualified references must name it.
    fn namespace(&self) -> &str;

    async fn full_schema(&self) -> Result<SchemaSnapshot>;

    async fn all_table_names(&self) -> Result<Vec<String>>;

    /// Empty when the table does not exist.
    async fn columns_of(&self, table: &str) -> Result<Vec<ColumnSummary>>;

    async fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.all_table_names().await?.iter().any(|t| t == name))
    }

    async fn compact_schema(&self, max_tables: usize) -> Result<CompactSchema> {
        Ok(self.full_schema().await?.compact(max_tables))
    }
}

/// Reads `pg_catalog` / `information_schema` for one schema namespace.
pub struct PgIntrospector {
    connections: Arc<ConnectionManager>,
    schema: String,
}

impl PgIntrospector {
    pub fn new(connections: Arc<ConnectionManager>, schema: impl Into<String>) -> Self {
        Self {
            connections,
            schema: schema.into(),
        }
    }

    async fn session(&self) -> Result<Arc<Client>> {
        self.connections
            .shared()
            .await
            .map_err(|e| Error::Schema(e.to_string()))
    }
}

fn schema_error(err: tokio_postgres::Error) -> Error {
    Error::Schema(err.to_string())
}

const RELKINDS: &str = "('r', 'p', 'v', 'm', 'f')";

fn fk_action(code: &str) -> String {
    match code {
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => "NO ACTION",
    }
    .to_string()
}

async fn get_table_names(client: &Arc<Client>, schema: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT c.relname::text
         FROM pg_catalog.pg_class c
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relkind IN {RELKINDS}
         ORDER BY c.relname"
    );
    let rows = client
        .query(sql.as_str(), &[&schema])
        .await
        .map_err(schema_error)?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

async fn get_columns(
    client: &Arc<Client>,
    schema: &str,
) -> Result<Vec<(String, ColumnSchema)>> {
    let rows = client
        .query(
            "SELECT
                c.table_name::text,
                c.column_name::text,
                (CASE WHEN c.data_type IN ('USER-DEFINED', 'ARRAY') THEN c.udt_name
                      ELSE c.data_type END)::text,
                c.character_maximum_length::int4,
                c.is_nullable = 'YES',
                c.column_default::text,
                (c.is_identity = 'YES' OR COALESCE(c.column_default, '') LIKE 'nextval(%'),
                col_description(
                    format('%I.%I', c.table_schema, c.table_name)::regclass,
                    c.ordinal_position::int
                )
             FROM information_schema.columns c
             WHERE c.table_schema = $1
             ORDER BY c.table_name, c.ordinal_position",
            &[&schema],
        )
        .await
        .map_err(schema_error)?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get(0),
                ColumnSchema {
                    name: row.get(1),
                    data_type: row.get(2),
                    length: row.get(3),
                    nullable: row.get(4),
                    default: row.get(5),
                    auto_increment: row.get(6),
                    comment: row.get(7),
                },
            )
        })
        .collect())
}

struct ConstraintRow {
    table: String,
    name: String,
    kind: String,
    local_columns: Vec<String>,
    foreign_table: Option<String>,
    foreign_columns: Vec<String>,
    on_update: String,
    on_delete: String,
}

async fn get_constraints(client: &Arc<Client>, schema: &str) -> Result<Vec<ConstraintRow>> {
    let rows = client
        .query(
            "SELECT
                rel.relname::text,
                con.conname::text,
                con.contype::text,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.conkey) WITH ORDINALITY k(attnum, ord)
                    JOIN pg_catalog.pg_attribute a
                        ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ),
                frel.relname::text,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.confkey) WITH ORDINALITY k(attnum, ord)
                    JOIN pg_catalog.pg_attribute a
                        ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ),
                con.confupdtype::text,
                con.confdeltype::text
             FROM pg_catalog.pg_constraint con
             JOIN pg_catalog.pg_class rel ON rel.oid = con.conrelid
             JOIN pg_catalog.pg_namespace n ON n.oid = rel.relnamespace
             LEFT JOIN pg_catalog.pg_class frel ON frel.oid = con.confrelid
             WHERE n.nspname = $1 AND con.contype IN ('p', 'f')
             ORDER BY rel.relname, con.conname",
            &[&schema],
        )
        .await
        .map_err(schema_error)?;

    Ok(rows
        .iter()
        .map(|row| ConstraintRow {
            table: row.get(0),
            name: row.get(1),
            kind: row.get(2),
            local_columns: row.get(3),
            foreign_table: row.get(4),
            foreign_columns: row.get(5),
            on_update: row.get(6),
            on_delete: row.get(7),
        })
        .collect())
}

async fn get_indexes(client: &Arc<Client>, schema: &str) -> Result<Vec<(String, IndexSchema)>> {
    let rows = client
        .query(
            "SELECT
                t.relname::text,
                i.relname::text,
                ix.indisunique,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(ix.indkey::int2[]) WITH ORDINALITY k(attnum, ord)
                    JOIN pg_catalog.pg_attribute a
                        ON a.attrelid = ix.indrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                )
             FROM pg_catalog.pg_index ix
             JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
             JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
             JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
             WHERE n.nspname = $1 AND NOT ix.indisprimary
             ORDER BY t.relname, i.relname",
            &[&schema],
        )
        .await
        .map_err(schema_error)?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get(0),
                IndexSchema {
                    name: row.get(1),
                    unique: row.get(2),
                    columns: row.get(3),
                },
            )
        })
        .collect())
}

#[async_trait]
impl SchemaSource for PgIntrospector {
    fn namespace(&self) -> &str {
        &self.schema
    }

    async fn full_schema(&self) -> Result<SchemaSnapshot> {
        let client = self.session().await?;
        let database: String = client
            .query_one("SELECT current_database()::text", &[])
            .await
            .map_err(schema_error)?
            .get(0);

        let mut tables: Vec<TableSchema> = get_table_names(&client, &self.schema)
            .await?
            .into_iter()
            .map(|name| TableSchema {
                name,
                columns: Vec::new(),
                primary_key: Vec::new(),
                foreign_keys: Vec::new(),
                indexes: Vec::new(),
            })
            .collect();
        let position: HashMap<String, usize> = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        for (table, column) in get_columns(&client, &self.schema).await? {
            if let Some(&i) = position.get(&table) {
                tables[i].columns.push(column);
            }
        }

        for con in get_constraints(&client, &self.schema).await? {
            let Some(&i) = position.get(&con.table) else {
                continue;
            };
            if con.kind == "p" {
                tables[i].primary_key = con.local_columns;
            } else {
                tables[i].foreign_keys.push(ForeignKey {
                    name: con.name,
                    local_columns: con.local_columns,
                    foreign_table: con.foreign_table.unwrap_or_default(),
                    foreign_columns: con.foreign_columns,
                    on_update: fk_action(&con.on_update),
                    on_delete: fk_action(&con.on_delete),
                });
            }
        }

        for (table, index) in get_indexes(&client, &self.schema).await? {
            if let Some(&i) = position.get(&table) {
                tables[i].indexes.push(index);
            }
        }

        Ok(SchemaSnapshot { database, tables })
    }

    async fn all_table_names(&self) -> Result<Vec<String>> {
        get_table_names(&self.session().await?, &self.schema).await
    }

    async fn columns_of(&self, table: &str) -> Result<Vec<ColumnSummary>> {
        let rows = self
            .session()
            .await?
            .query(
                "SELECT
                    c.column_name::text,
                    (CASE WHEN c.data_type IN ('USER-DEFINED', 'ARRAY') THEN c.udt_name
                          ELSE c.data_type END)::text,
                    c.is_nullable = 'YES'
                 FROM information_schema.columns c
                 WHERE c.table_schema = $1 AND c.table_name = $2
                 ORDER BY c.ordinal_position",
                &[&self.schema, &table],
            )
            .await
            .map_err(schema_error)?;

        Ok(rows
            .iter()
            .map(|row| ColumnSummary {
                name: row.get(0),
                data_type: row.get(1),
                nullable: row.get(2),
            })
            .collect())
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (
                SELECT 1
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN {RELKINDS}
             )"
        );
        let row = self
            .session()
            .await?
            .query_one(sql.as_str(), &[&self.schema, &name])
            .await
            .map_err(schema_error)?;
        Ok(row.get(0))
    }
}
