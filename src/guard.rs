//! Pre-execution check of a generated statement against the schema snapshot.
//!
//! Off by default: with it on, a hallucinated table becomes a generation
//! failure instead of an execution failure, and the statement never reaches
//! the database.
//!
//! Only relations are checked. Column names are not resolved here, so a
//! made-up column still reaches the database and fails there as an unknown
//! relation.

use std::collections::HashSet;
use std::ops::ControlFlow;

use sqlparser::ast::{Ident, ObjectName, Query, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;

use crate::db::SchemaSnapshot;
use crate::error::GenerationError;

/// Unquoted identifiers fold to lower case, quoted ones are taken verbatim.
fn normalize(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

#[derive(Default)]
struct RelationCollector {
    ctes: HashSet<String>,
    relations: Vec<Vec<String>>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(normalize(&cte.alias.name));
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations
            .push(relation.0.iter().map(normalize).collect());
        ControlFlow::Continue(())
    }
}

/// Accept `sql` only if it is one statement whose relations all exist in `schema`.
///
/// Relations qualified with another namespace (e.g. `pg_catalog.pg_tables`) are
/// left for the database to judge.
pub fn verify_statement(sql: &str, schema: &SchemaSnapshot) -> Result<(), GenerationError> {
    let statements = SqlParser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| GenerationError::Unparseable(e.to_string()))?;

    let [statement] = statements.as_slice() else {
        return Err(GenerationError::MultipleStatements(statements.len()));
    };

    let mut collector = RelationCollector::default();
    let _ = statement.visit(&mut collector);

    for parts in &collector.relations {
        let Some((name, qualifiers)) = parts.split_last() else {
            continue;
        };
        let foreign_namespace = qualifiers
            .last()
            .is_some_and(|ns| *ns != schema.namespace);
        if foreign_namespace || (qualifiers.is_empty() && collector.ctes.contains(name)) {
            continue;
        }
        if schema.table(name).is_none() {
            return Err(GenerationError::UnknownIdentifier(name.clone()));
        }
    }
    Ok(())
}
