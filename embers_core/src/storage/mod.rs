pub mod memory;
pub mod postgres;
pub mod sqlite;
pub mod traits;

use crate::loader::schema::TableSchema;

/// Double-quote an identifier. Schema validation already restricts names to `[a-z0-9_]`.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quoted_table(schema: &TableSchema) -> String {
    match &schema.namespace {
        Some(ns) => format!("{}.{}", quote_ident(ns), quote_ident(&schema.table)),
        None => quote_ident(&schema.table),
    }
}

/// Rows per INSERT statement so that a statement stays under the driver's bind limit.
pub(crate) fn rows_per_statement(chunk_size: usize, columns: usize, max_binds: usize) -> usize {
    chunk_size.min(max_binds / columns.max(1)).max(1)
}

/// `INSERT INTO t (c1, c2, ...) ` prefix shared by the SQL stores.
pub(crate) fn insert_prefix(table: &str, schema: &TableSchema) -> String {
    let columns = schema
        .fields
        .iter()
        .map(|f| quote_ident(&f.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {table} ({columns}) ")
}

/// ` ON CONFLICT (key) DO UPDATE SET c = EXCLUDED.c, ...` (full-row replace).
pub(crate) fn on_conflict_replace(schema: &TableSchema) -> String {
    let sets = schema
        .update_columns()
        .map(|f| {
            let c = quote_ident(&f.name);
            format!("{c} = EXCLUDED.{c}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        " ON CONFLICT ({}) DO UPDATE SET {sets}",
        quote_ident(&schema.key_field)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::schema::{FieldSpec, FieldType};

    #[test]
    fn statement_size_respects_bind_limit() {
        assert_eq!(rows_per_statement(50_000, 66, 65_535), 992);
        assert_eq!(rows_per_statement(10, 66, 65_535), 10);
        assert_eq!(rows_per_statement(5, 100_000, 10), 1);
    }

    #[test]
    fn upsert_sql_replaces_every_non_key_column() {
        let schema = TableSchema::new(
            Some("incidents".to_string()),
            "incidents",
            "id",
            "data_loaded_at",
            vec![
                FieldSpec::new("id", FieldType::Text),
                FieldSpec::new("data_loaded_at", FieldType::Timestamp),
                FieldSpec::new("city", FieldType::Text),
            ],
        )
        .unwrap();
        let table = quoted_table(&schema);
        assert_eq!(table, "\"incidents\".\"incidents\"");
        assert_eq!(
            insert_prefix(&table, &schema),
            "INSERT INTO \"incidents\".\"incidents\" (\"id\", \"data_loaded_at\", \"city\") "
        );
        assert_eq!(
            on_conflict_replace(&schema),
            " ON CONFLICT (\"id\") DO UPDATE SET \"data_loaded_at\" = EXCLUDED.\"data_loaded_at\", \"city\" = EXCLUDED.\"city\""
        );
    }
}
