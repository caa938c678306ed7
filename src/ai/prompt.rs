use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::SchemaSource;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

const RULES: &str = "\
You are a SQL generator for PostgreSQL.

STRICT RULES:
1. Respond ONLY with a single SQL statement
2. NO explanations, NO comments, NO markdown code fences
3. ONLY SELECT statements are allowed (JOIN, GROUP BY, HAVING, ORDER BY, LIMIT and OFFSET are fine; write LIMIT, not FETCH FIRST)
4. Use ONLY tables and columns listed in the schema below
5. Time references like \"last week\" are relative to NOW()
6. Table and column names that are reserved words MUST be double-quoted: \"order\", \"group\", \"user\"
7. Binary identifier columns (bytea: id, product_id, customer_id, ...) MUST be wrapped as encode(<column>, 'hex')
8. Return ONLY the SQL string, nothing else";

const EXAMPLES: &str = "\
EXAMPLES:

User: \"Give me all orders from last week\"
SQL: SELECT encode(o.id, 'hex') AS id, o.order_number, o.order_date_time FROM \"order\" o WHERE o.order_date_time >= NOW() - INTERVAL '7 days' ORDER BY o.order_date_time DESC

User: \"Give me all sold products from last week\"
SQL: SELECT encode(oli.product_id, 'hex') AS product_id, p.product_number, SUM(oli.quantity) AS qty FROM \"order\" o JOIN order_line_item oli ON oli.order_id = o.id LEFT JOIN product p ON p.id = oli.product_id WHERE o.order_date_time >= NOW() - INTERVAL '7 days' AND oli.type = 'product' GROUP BY oli.product_id, p.product_number ORDER BY qty DESC

User: \"Top 10 customers by revenue last month\"
SQL: SELECT encode(c.id, 'hex') AS id, c.first_name, c.last_name, c.email, SUM(o.amount_total) AS revenue FROM customer c JOIN \"order\" o ON o.order_customer_id = c.id WHERE o.order_date_time >= NOW() - INTERVAL '1 month' GROUP BY c.id, c.first_name, c.last_name, c.email ORDER BY revenue DESC LIMIT 10

User: \"Show me products with low stock (less than 10)\"
SQL: SELECT encode(p.id, 'hex') AS id, p.product_number, p.stock FROM product p WHERE p.stock < 10 AND p.active ORDER BY p.stock ASC

User: \"Orders with status 'open' today\"
SQL: SELECT encode(o.id, 'hex') AS id, o.order_number, o.order_date_time, sm.technical_name AS status FROM \"order\" o JOIN state_machine_state sm ON o.state_id = sm.id WHERE o.order_date_time::date = CURRENT_DATE AND sm.technical_name = 'open' ORDER BY o.order_date_time DESC

IMPORTANT:
- Always use encode(..., 'hex') for bytea identifier columns
- Always use table aliases
- Double-quote reserved words (order, group, user)
- Prefer explicit JOIN over implicit joins
- Use PostgreSQL date/time functions (NOW(), CURRENT_DATE, INTERVAL '...', date_trunc)
- Return ONLY the SQL, no formatting, no explanation";

/// Assemble the system prompt around an already rendered schema.
pub fn system_prompt(schema_text: &str, locale: &str) -> String {
    format!(
        "{RULES}\n\nUSER LOCALE: {locale} (interpret weekdays, dates and relative time in this locale)\n\n\
         DATABASE SCHEMA:\n{schema}\n\n{EXAMPLES}",
        schema = schema_text.trim_end()
    )
}

/// User message asking for a corrected statement.
pub fn correction_request(failed_sql: &str, error: &str, original_prompt: Option<&str>) -> String {
    let mut text = String::from("The following SQL query caused an error:\n\n");
    if let Some(prompt) = original_prompt.map(str::trim).filter(|p| !p.is_empty()) {
        text.push_str(&format!("Original request:\n{}\n\n", prompt));
    }
    text.push_str(&format!("Generated SQL:\n{}\n\n", failed_sql));
    text.push_str(&format!("Error:\n{}\n\n", error));
    text.push_str("Analyze the error and generate a corrected SQL query.");
    text
}

pub struct PromptComposer {
    schema: Arc<dyn SchemaSource>,
    locale: String,
}

impl PromptComposer {
    pub fn new(schema: Arc<dyn SchemaSource>, locale: impl Into<String>) -> Self {
        Self {
            schema,
            locale: locale.into(),
        }
    }

    async fn schema_text(&self, use_compact: bool, max_tables: usize) -> Result<String> {
        if use_compact {
            let compact = self.schema.compact_schema(max_tables).await?;
            Ok(format!(
                "-- database: {}\n{}",
                compact.database,
                compact.to_ddl_summary()
            ))
        } else {
            let full = self.schema.full_schema().await?;
            serde_json::to_string_pretty(&full).map_err(|e| Error::Schema(e.to_string()))
        }
    }

    pub async fn build_system_prompt(&self, use_compact: bool, max_tables: usize) -> Result<String> {
        let schema = self.schema_text(use_compact, max_tables).await?;
        Ok(system_prompt(&schema, &self.locale))
    }

    pub async fn build_messages(
        &self,
        user_text: &str,
        use_compact: bool,
        max_tables: usize,
    ) -> Result<Vec<PromptMessage>> {
        Ok(vec![
            PromptMessage::system(self.build_system_prompt(use_compact, max_tables).await?),
            PromptMessage::user(user_text.trim()),
        ])
    }

    pub async fn build_error_correction_messages(
        &self,
        failed_sql: &str,
        error: &str,
        original_prompt: Option<&str>,
        use_compact: bool,
        max_tables: usize,
    ) -> Result<Vec<PromptMessage>> {
        Ok(vec![
            PromptMessage::system(self.build_system_prompt(use_compact, max_tables).await?),
            PromptMessage::user(correction_request(failed_sql, error, original_prompt)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ColumnSchema, ColumnSummary, SchemaSnapshot, TableSchema};
    use async_trait::async_trait;

    struct OneTable;

    #[async_trait]
    impl SchemaSource for OneTable {
        fn namespace(&self) -> &str {
            "public"
        }

        async fn full_schema(&self) -> Result<SchemaSnapshot> {
            Ok(SchemaSnapshot {
                database: "shop".into(),
                tables: vec![TableSchema {
                    name: "product".into(),
                    columns: vec![ColumnSchema {
                        name: "stock".into(),
                        data_type: "integer".into(),
                        length: None,
                        nullable: false,
                        default: Some("0".into()),
                        auto_increment: false,
                        comment: None,
                    }],
                    primary_key: vec![],
                    foreign_keys: vec![],
                    indexes: vec![],
                }],
            })
        }

        async fn all_table_names(&self) -> Result<Vec<String>> {
            Ok(vec!["product".into()])
        }

        async fn columns_of(&self, _table: &str) -> Result<Vec<ColumnSummary>> {
            Ok(vec![])
        }
    }

    fn composer() -> PromptComposer {
        PromptComposer::new(Arc::new(OneTable), "de_DE")
    }

    #[tokio::test]
    async fn builds_system_and_trimmed_user_message() {
        let messages = composer()
            .build_messages("  low stock products \n", true, 10)
            .await
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("-- database: shop"));
        assert!(messages[0].content.contains("CREATE TABLE product"));
        assert!(messages[0].content.contains("encode(<column>, 'hex')"));
        assert!(messages[0].content.contains("USER LOCALE: de_DE"));
        assert_eq!(messages[1], PromptMessage::user("low stock products"));
    }

    #[tokio::test]
    async fn full_schema_is_embedded_as_json() {
        let messages = composer().build_messages("x", false, 0).await.unwrap();
        assert!(messages[0].content.contains("\"database\": \"shop\""));
        assert!(messages[0].content.contains("\"autoIncrement\": false"));
    }

    #[tokio::test]
    async fn system_prompt_is_deterministic() {
        let a = composer().build_messages("q", true, 5).await.unwrap();
        let b = composer().build_messages("q", true, 5).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn correction_messages_embed_failed_sql_and_error() {
        let messages = composer()
            .build_error_correction_messages(
                "SELECT nope FROM product",
                "column \"nope\" does not exist",
                Some("show stock"),
                true,
                10,
            )
            .await
            .unwrap();

        let user = &messages[1];
        assert_eq!(user.role, Role::User);
        assert!(user.content.contains("Original request:\nshow stock"));
        assert!(user.content.contains("Generated SQL:\nSELECT nope FROM product"));
        assert!(user.content.contains("Error:\ncolumn \"nope\" does not exist"));
        assert!(user.content.ends_with("generate a corrected SQL query."));
    }

    #[test]
    fn blank_original_prompt_is_omitted() {
        let text = correction_request("SELECT 1", "boom", Some("   "));
        assert!(!text.contains("Original request"));
        assert!(correction_request("SELECT 1", "boom", None).starts_with(
            "The following SQL query caused an error:\n\nGenerated SQL:"
        ));
    }

    #[test]
    fn messages_serialize_with_lowercase_roles() {
        let json = serde_json::to_value(PromptMessage::system("x")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "system", "content": "x"}));
    }
}
