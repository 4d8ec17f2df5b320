//! Compact text rendering of a schema snapshot for model prompts.
//!
//! ```text
//! Table: orders
//! Columns: id (integer), customer_id (integer) [FK customers.id]
//!
//! Table: customers
//! Columns: id (integer), name (text)
//! ```
//!
//! Output order follows the snapshot exactly, so identical snapshots always
//! render to identical text. An empty snapshot renders to an empty string.

use crate::db::{ColumnDescriptor, SchemaSnapshot, TableDescriptor};

pub fn format_schema(schema: &SchemaSnapshot) -> String {
    schema
        .tables
        .iter()
        .map(format_table)
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn format_table(table: &TableDescriptor) -> String {
    let columns = table
        .columns
        .iter()
        .map(format_column)
        .collect::<Vec<_>>()
        .join(", ");
    format!("Table: {}\nColumns: {}", table.table_name, columns)
}

fn format_column(column: &ColumnDescriptor) -> String {
    match &column.foreign_key {
        Some(fk) => format!("{} ({}) [FK {}]", column.name, column.data_type, fk),
        None => format!("{} ({})", column.name, column.data_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ForeignKeyRef;

    fn column(name: &str, data_type: &str, fk: Option<(&str, &str)>) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            foreign_key: fk.map(|(table, column)| ForeignKeyRef {
                table: table.to_string(),
                column: column.to_string(),
            }),
        }
    }

    fn shop() -> SchemaSnapshot {
        SchemaSnapshot {
            namespace: "public".to_string(),
            tables: vec![
                TableDescriptor {
                    table_name: "orders".to_string(),
                    columns: vec![
                        column("id", "integer", None),
                        column("customer_id", "integer", Some(("customers", "id"))),
                        column("total", "numeric", None),
                    ],
                },
                TableDescriptor {
                    table_name: "customers".to_string(),
                    columns: vec![column("id", "integer", None), column("name", "text", None)],
                },
            ],
        }
    }

    #[test]
    fn test_format_schema_golden() {
        let expected = "Table: orders\n\
                        Columns: id (integer), customer_id (integer) [FK customers.id], total (numeric)\n\
                        \n\
                        Table: customers\n\
                        Columns: id (integer), name (text)";
        assert_eq!(format_schema(&shop()), expected);
    }

    #[test]
    fn test_format_is_deterministic() {
        let schema = shop();
        assert_eq!(format_schema(&schema), format_schema(&schema.clone()));
    }

    #[test]
    fn test_fk_suffix_only_on_referencing_columns() {
        let schema = shop();
        for table in &schema.tables {
            for col in &table.columns {
                let rendered = format_column(col);
                match &col.foreign_key {
                    Some(fk) => assert!(rendered.ends_with(&format!("[FK {}.{}]", fk.table, fk.column))),
                    None => assert!(!rendered.contains("[FK")),
                }
            }
        }
    }

    #[test]
    fn test_empty_schema_formats_to_empty_string() {
        assert_eq!(format_schema(&SchemaSnapshot::default()), "");
    }

    #[test]
    fn test_table_without_columns() {
        let table = TableDescriptor {
            table_name: "audit".to_string(),
            columns: vec![],
        };
        assert_eq!(format_table(&table), "Table: audit\nColumns: ");
    }
}
