//! Database tools
//!
//! Thin pass-throughs to the database REST service. Query results are
//! rendered as a Markdown table followed by the raw JSON.

use crate::backend::DatabaseClient;
use crate::mcp::protocol::ToolsCallResult;
use crate::registry::{
    InputSchema, PropertyType, ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolProvider, ToolResult,
};
use crate::tools::{optional_str, optional_u64, required_str};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

const DEFAULT_READ_LIMIT: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Health,
    ListDatabases,
    ListSchemas,
    ListTables,
    ExecuteSql,
    ExecuteWriteSql,
    ReadRecords,
    ReadRecord,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
}

struct DatabaseHandler {
    client: DatabaseClient,
    operation: Operation,
}

#[async_trait]
impl ToolHandler for DatabaseHandler {
    async fn call(&self, args: Value, _ctx: ToolContext) -> ToolResult {
        let client = &self.client;
        match self.operation {
            Operation::Health => {
                let response = client.get(&["admin", "health"], &[]).await?;
                let report = json!({
                    "status": response.get("status").cloned().unwrap_or_else(|| json!("connected")),
                    "database": response
                        .get("database")
                        .or_else(|| response.get("database_connected"))
                        .cloned()
                        .unwrap_or(Value::Null),
                    "service_url": client.base_url(),
                    "response": response,
                });
                render_json(&report)
            }
            Operation::ListDatabases => {
                let response = client.get(&["admin", "databases"], &[]).await?;
                render_listing("databases", &response)
            }
            Operation::ListSchemas => {
                let response = client.get(&["admin", "schemas"], &[]).await?;
                render_listing("schemas", &response)
            }
            Operation::ListTables => {
                let response = match optional_str(&args, "schema_name") {
                    Some(schema) => client.get(&["admin", "tables", schema], &[]).await?,
                    None => client.get(&["admin", "tables"], &[]).await?,
                };
                render_listing("tables", &response)
            }
            Operation::ExecuteSql | Operation::ExecuteWriteSql => {
                let body = json!({
                    "sql": required_str(&args, "sql")?,
                    "parameters": args.get("parameters").cloned().unwrap_or_else(|| json!({})),
                });
                let path: &[&str] = if self.operation == Operation::ExecuteSql {
                    &["crud", "raw-sql"]
                } else {
                    &["crud", "raw-sql", "write"]
                };
                let response = client.post(path, &body).await?;
                render_rows(&response)
            }
            Operation::ReadRecords => {
                let schema = required_str(&args, "schema_name")?;
                let table = required_str(&args, "table_name")?;
                let mut query = vec![
                    ("limit", optional_u64(&args, "limit")?.unwrap_or(DEFAULT_READ_LIMIT).to_string()),
                    ("offset", optional_u64(&args, "offset")?.unwrap_or(0).to_string()),
                ];
                if let Some(order_by) = optional_str(&args, "order_by") {
                    query.push(("order_by", order_by.to_string()));
                }
                let response = client.get(&["crud", schema, table], &query).await?;
                render_rows(&response)
            }
            Operation::ReadRecord => {
                let (schema, table, id) = record_path(&args)?;
                let response = client.get(&["crud", schema, table, id], &[]).await?;
                render_json(&response)
            }
            Operation::CreateRecord => {
                let schema = required_str(&args, "schema_name")?;
                let table = required_str(&args, "table_name")?;
                let body = json!({ "data": record_data(&args)? });
                let response = client.post(&["crud", schema, table], &body).await?;
                render_json(&response)
            }
            Operation::UpdateRecord => {
                let (schema, table, id) = record_path(&args)?;
                let body = json!({ "data": record_data(&args)? });
                let response = client.put(&["crud", schema, table, id], &body).await?;
                render_json(&response)
            }
            Operation::DeleteRecord => {
                let (schema, table, id) = record_path(&args)?;
                let response = client.delete(&["crud", schema, table, id]).await?;
                render_json(&response)
            }
        }
    }
}

pub struct DatabaseTools {
    client: DatabaseClient,
}

impl DatabaseTools {
    pub fn new(client: DatabaseClient) -> Self {
        Self { client }
    }

    fn tool(&self, name: &str, description: &str, schema: InputSchema, operation: Operation) -> ToolDescriptor {
        ToolDescriptor::new(
            name,
            description,
            schema,
            Arc::new(DatabaseHandler {
                client: self.client.clone(),
                operation,
            }),
        )
    }
}

impl ToolProvider for DatabaseTools {
    fn name(&self) -> &'static str {
        "database"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        let table = || {
            InputSchema::empty()
                .required("schema_name", PropertyType::String, "Schema containing the table")
                .required("table_name", PropertyType::String, "Table name")
        };
        let sql = || {
            InputSchema::empty()
                .required("sql", PropertyType::String, "SQL statement to execute")
                .property("parameters", PropertyType::Object, "Named bind parameters")
        };

        vec![
            self.tool(
                "database_health",
                "Check database service health and connectivity",
                InputSchema::empty(),
                Operation::Health,
            ),
            self.tool(
                "list_databases",
                "List all available databases",
                InputSchema::empty(),
                Operation::ListDatabases,
            ),
            self.tool(
                "list_schemas",
                "List all schemas in the database",
                InputSchema::empty(),
                Operation::ListSchemas,
            ),
            self.tool(
                "list_tables",
                "List tables in the database, optionally limited to one schema",
                InputSchema::empty().property("schema_name", PropertyType::String, "Schema to list tables from"),
                Operation::ListTables,
            ),
            self.tool(
                "execute_sql",
                "Execute a read-only SQL query",
                sql(),
                Operation::ExecuteSql,
            ),
            self.tool(
                "execute_write_sql",
                "Execute a SQL write statement (INSERT, UPDATE, DELETE)",
                sql(),
                Operation::ExecuteWriteSql,
            ),
            self.tool(
                "read_records",
                "Read records from a table with pagination",
                table()
                    .property_with_default("limit", PropertyType::Integer, "Maximum rows to return", json!(DEFAULT_READ_LIMIT))
                    .property_with_default("offset", PropertyType::Integer, "Rows to skip", json!(0))
                    .property("order_by", PropertyType::String, "Column to order by"),
                Operation::ReadRecords,
            ),
            self.tool(
                "read_record",
                "Read a single record by primary key",
                table().required("record_id", PropertyType::String, "Primary key value"),
                Operation::ReadRecord,
            ),
            self.tool(
                "create_record",
                "Insert a new record",
                table().required("data", PropertyType::Object, "Column values"),
                Operation::CreateRecord,
            ),
            self.tool(
                "update_record",
                "Update a record by primary key",
                table()
                    .required("record_id", PropertyType::String, "Primary key value")
                    .required("data", PropertyType::Object, "Column values to change"),
                Operation::UpdateRecord,
            ),
            self.tool(
                "delete_record",
                "Delete a record by primary key",
                table().required("record_id", PropertyType::String, "Primary key value"),
                Operation::DeleteRecord,
            ),
        ]
    }
}

fn record_path(args: &Value) -> Result<(&str, &str, &str), ToolError> {
    Ok((
        required_str(args, "schema_name")?,
        required_str(args, "table_name")?,
        required_str(args, "record_id")?,
    ))
}

fn record_data(args: &Value) -> Result<Value, ToolError> {
    match args.get("data") {
        Some(data @ Value::Object(_)) => Ok(data.clone()),
        _ => Err(ToolError::InvalidArguments("'data' must be an object".to_string())),
    }
}

fn render_json(value: &Value) -> ToolResult {
    ToolsCallResult::json(value).map_err(|e| ToolError::Internal(format!("failed to render result: {}", e)))
}

fn render_listing(key: &str, response: &Value) -> ToolResult {
    let items = response
        .get(key)
        .and_then(Value::as_array)
        .or_else(|| response.as_array());

    match items {
        Some(items) => {
            let mut text = format!("Found {} {}\n", items.len(), key);
            for item in items {
                let label = match item {
                    Value::String(s) => s.clone(),
                    Value::Object(obj) => obj
                        .get("name")
                        .or_else(|| obj.get("table_name"))
                        .or_else(|| obj.get("schema_name"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| item.to_string()),
                    other => other.to_string(),
                };
                text.push_str("- ");
                text.push_str(&label);
                text.push('\n');
            }
            Ok(ToolsCallResult::text(text.trim_end()))
        }
        None => render_json(response),
    }
}

fn render_rows(response: &Value) -> ToolResult {
    let rows = ["data", "rows", "records", "results"]
        .iter()
        .find_map(|key| response.get(*key).and_then(Value::as_array))
        .or_else(|| response.as_array());

    let raw = serde_json::to_string_pretty(response)
        .map_err(|e| ToolError::Internal(format!("failed to render result: {}", e)))?;

    let text = match rows {
        Some(rows) if !rows.is_empty() => format!(
            "{} row(s)\n\n{}\n\n```json\n{}\n```",
            rows.len(),
            markdown_table(rows),
            raw
        ),
        Some(_) => format!("0 rows\n\n```json\n{}\n```", raw),
        None => format!("```json\n{}\n```", raw),
    };
    Ok(ToolsCallResult::text(text))
}

/// Columns are the union of row keys in first-seen order.
fn markdown_table(rows: &[Value]) -> String {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        if let Value::Object(obj) = row {
            for key in obj.keys() {
                if !columns.contains(&key.as_str()) {
                    columns.push(key);
                }
            }
        }
    }

    if columns.is_empty() {
        let mut out = String::from("| value |\n| --- |\n");
        for row in rows {
            out.push_str(&format!("| {} |\n", cell(row)));
        }
        return out.trim_end().to_string();
    }

    let empty = Map::new();
    let mut out = format!("| {} |\n", columns.join(" | "));
    out.push_str(&format!("|{}\n", " --- |".repeat(columns.len())));
    for row in rows {
        let obj = row.as_object().unwrap_or(&empty);
        let cells: Vec<String> = columns
            .iter()
            .map(|c| obj.get(*c).map(cell).unwrap_or_default())
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out.trim_end().to_string()
}

fn cell(value: &Value) -> String {
    let text = match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.replace('|', "\\|").replace('\n', " ")
}
