use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::error::IntrospectionError;

/// A `table.column` pointer to the target of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

impl std::fmt::Display for ForeignKeyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyRef>,
}

/// A base table and its columns in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub table_name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// The base tables of one namespace as they were when fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub namespace: String,
    pub tables: Vec<TableDescriptor>,
}

impl SchemaSnapshot {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.table_name == name)
    }
}

/// One row of the foreign-key catalog query.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyRow {
    pub table_name: String,
    pub column_name: String,
    pub foreign_table_name: String,
    pub foreign_column_name: String,
}

/// Attach foreign-key pointers onto the columns that own them.
///
/// The first constraint listed for a column wins; rows naming unknown
/// tables or columns are ignored.
pub fn attach_foreign_keys(tables: &mut [TableDescriptor], foreign_keys: &[ForeignKeyRow]) {
    let mut by_column: HashMap<(&str, &str), ForeignKeyRef> = HashMap::new();
    for fk in foreign_keys {
        by_column
            .entry((fk.table_name.as_str(), fk.column_name.as_str()))
            .or_insert_with(|| ForeignKeyRef {
                table: fk.foreign_table_name.clone(),
                column: fk.foreign_column_name.clone(),
            });
    }

    for table in tables.iter_mut() {
        for column in table.columns.iter_mut() {
            column.foreign_key = by_column
                .get(&(table.table_name.as_str(), column.name.as_str()))
                .cloned();
        }
    }
}

fn catalog_error(namespace: &str, err: tokio_postgres::Error) -> IntrospectionError {
    let message = match err.as_db_error() {
        Some(db_err) => db_err.message().to_string(),
        None => err.to_string(),
    };
    IntrospectionError {
        namespace: namespace.to_string(),
        message,
    }
}

pub async fn get_tables(client: &Client, namespace: &str) -> Result<Vec<String>, IntrospectionError> {
    let rows = client
        .query(
            r#"
            SELECT table_name::text AS name
            FROM information_schema.tables
            WHERE table_schema = $1
              AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
            &[&namespace],
        )
        .await
        .map_err(|e| catalog_error(namespace, e))?;

    Ok(rows.iter().map(|row| row.get("name")).collect())
}

pub async fn get_columns(
    client: &Client,
    namespace: &str,
    table: &str,
) -> Result<Vec<ColumnDescriptor>, IntrospectionError> {
    let rows = client
        .query(
            r#"
            SELECT
                column_name::text AS name,
                data_type::text AS data_type,
                is_nullable = 'YES' AS nullable
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
            &[&namespace, &table],
        )
        .await
        .map_err(|e| catalog_error(namespace, e))?;

    let columns = rows
        .iter()
        .map(|row| ColumnDescriptor {
            name: row.get("name"),
            data_type: row.get("data_type"),
            nullable: row.get("nullable"),
            foreign_key: None,
        })
        .collect();

    Ok(columns)
}

pub async fn get_foreign_keys(
    client: &Client,
    namespace: &str,
) -> Result<Vec<ForeignKeyRow>, IntrospectionError> {
    let rows = client
        .query(
            r#"
            SELECT
                kcu.table_name::text AS table_name,
                kcu.column_name::text AS column_name,
                ccu.table_name::text AS foreign_table_name,
                ccu.column_name::text AS foreign_column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
                AND tc.constraint_schema = ccu.constraint_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1
            ORDER BY kcu.table_name, kcu.column_name, tc.constraint_name
            "#,
            &[&namespace],
        )
        .await
        .map_err(|e| catalog_error(namespace, e))?;

    let foreign_keys = rows
        .iter()
        .map(|row| ForeignKeyRow {
            table_name: row.get("table_name"),
            column_name: row.get("column_name"),
            foreign_table_name: row.get("foreign_table_name"),
            foreign_column_name: row.get("foreign_column_name"),
        })
        .collect();

    Ok(foreign_keys)
}

/// Read the base tables of `namespace` with their columns and foreign keys.
pub async fn introspect(
    client: &Client,
    namespace: &str,
) -> Result<SchemaSnapshot, IntrospectionError> {
    let table_names = get_tables(client, namespace).await?;
    debug!(namespace, count = table_names.len(), "listed base tables");

    let mut tables = Vec::with_capacity(table_names.len());
    for table_name in table_names {
        let columns = get_columns(client, namespace, &table_name).await?;
        tables.push(TableDescriptor {
            table_name,
            columns,
        });
    }

    let foreign_keys = get_foreign_keys(client, namespace).await?;
    attach_foreign_keys(&mut tables, &foreign_keys);

    info!(
        namespace,
        tables = tables.len(),
        foreign_keys = foreign_keys.len(),
        "schema introspected"
    );

    Ok(SchemaSnapshot {
        namespace: namespace.to_string(),
        tables,
    })
}
