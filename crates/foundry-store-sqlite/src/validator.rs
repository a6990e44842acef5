//! Read-only integrity checks of an artifact against a dialect.

use std::collections::BTreeMap;
use std::path::Path;

use foundry_core::dialect::{ForeignKey, RequiredJoin, TableSpec, PROPERTIES_TABLE};
use foundry_core::guid::classify;
use foundry_core::{Dialect, FoundryError, GuidFamily, ValidationReport, Violation, ViolationKind};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sink::map_sqlite_error;

const OPERATION: &str = "validate artifact";

#[derive(Debug)]
struct ActualColumn {
    name: String,
    declared_type: String,
    not_null: bool,
    primary_key: bool,
}

/// Open `path` read-only and validate it.
///
/// # Errors
/// Returns [`FoundryError::DurableIo`] when the file cannot be opened or read.
pub fn validate_path(path: &Path, dialect: &Dialect) -> Result<ValidationReport, FoundryError> {
    if !path.exists() {
        return Err(FoundryError::DurableIo {
            operation: OPERATION.to_string(),
            attempts: 1,
            detail: format!("artifact does not exist: {}", path.display()),
        });
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|err| sqlite_error(&err))?;
    validate_connection(&conn, dialect)
}

/// Walk the artifact and report every violation found. Never writes.
///
/// # Errors
/// Returns [`FoundryError::DurableIo`] when a probe query fails.
pub fn validate_connection(
    conn: &Connection,
    dialect: &Dialect,
) -> Result<ValidationReport, FoundryError> {
    let mut report = ValidationReport::new(dialect.name.clone());
    let mut present = BTreeMap::new();

    for table in &dialect.tables {
        match table_columns(conn, &table.name)? {
            Some(actual) => {
                check_columns(&mut report, table, &actual);
                present.insert(table.name.clone(), actual);
            }
            None => report.push(Violation::new(
                ViolationKind::MissingTable,
                &table.name,
                format!("table {} is missing", table.name),
            )),
        }
    }
    let has_column = |table: &str, column: &str| {
        present.get(table).is_some_and(|columns: &Vec<ActualColumn>| {
            column == "ROWID" || columns.iter().any(|actual| actual.name == column)
        })
    };

    check_metadata(conn, dialect, &mut report, present.contains_key(PROPERTIES_TABLE))?;

    for edge in dialect.foreign_keys() {
        if has_column(&edge.child_table, &edge.child_column)
            && has_column(&edge.parent_table, &edge.parent_column)
        {
            check_foreign_key(conn, &edge, &mut report)?;
        }
    }

    for table in &dialect.tables {
        for key in table.unique_keys() {
            if key.iter().all(|column| has_column(&table.name, column)) {
                check_unique(conn, &table.name, &key, &mut report)?;
            }
        }
    }

    for join in &dialect.required_joins {
        if present.contains_key(&join.table) && has_column(&join.join_table, &join.join_column) {
            check_required_join(conn, join, &mut report)?;
        }
    }

    for (table, family) in [
        ("message", GuidFamily::Message),
        ("attachment", GuidFamily::Attachment),
        ("chat", GuidFamily::Chat),
    ] {
        if has_column(table, "guid") {
            check_guid_shapes(conn, table, family, &mut report)?;
        }
    }

    if has_column("message", "date")
        && has_column("chat_message_join", "message_id")
        && has_column("chat_message_join", "chat_id")
    {
        let order_column = if has_column("message", "sort_id") { "sort_id" } else { "ROWID" };
        check_timestamp_order(conn, order_column, &mut report)?;
    }

    tracing::debug!(
        dialect = %dialect.name,
        violations = report.violations.len(),
        errors = report.errors().count(),
        "validated artifact"
    );
    Ok(report)
}

fn sqlite_error(err: &rusqlite::Error) -> FoundryError {
    map_sqlite_error(OPERATION, 1, err)
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn table_columns(
    conn: &Connection,
    table: &str,
) -> Result<Option<Vec<ActualColumn>>, FoundryError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|err| sqlite_error(&err))?;
    if exists.is_none() {
        return Ok(None);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote(table)))
        .map_err(|err| sqlite_error(&err))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ActualColumn {
                name: row.get(1)?,
                declared_type: row.get(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                primary_key: row.get::<_, i64>(5)? != 0,
            })
        })
        .map_err(|err| sqlite_error(&err))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(|err| sqlite_error(&err))?);
    }
    Ok(Some(columns))
}

fn check_columns(report: &mut ValidationReport, table: &TableSpec, actual: &[ActualColumn]) {
    for expected in &table.columns {
        let Some(found) = actual.iter().find(|column| column.name == expected.name) else {
            report.push(Violation::new(
                ViolationKind::MissingColumn,
                &table.name,
                format!("column {}.{} is missing", table.name, expected.name),
            ));
            continue;
        };
        if !found.declared_type.eq_ignore_ascii_case(expected.column_type.as_sql()) {
            report.push(Violation::new(
                ViolationKind::ColumnMismatch,
                &table.name,
                format!(
                    "column {}.{} has type {}, expected {}",
                    table.name,
                    expected.name,
                    found.declared_type,
                    expected.column_type.as_sql()
                ),
            ));
        }
        if !expected.primary_key && !found.primary_key && found.not_null == expected.nullable {
            report.push(Violation::new(
                ViolationKind::ColumnMismatch,
                &table.name,
                format!(
                    "column {}.{} nullability differs: expected {}",
                    table.name,
                    expected.name,
                    if expected.nullable { "NULL" } else { "NOT NULL" }
                ),
            ));
        }
    }

    for extra in actual.iter().filter(|column| table.column(&column.name).is_none()) {
        report.push(Violation::new(
            ViolationKind::ColumnMismatch,
            &table.name,
            format!("column {}.{} is not part of the dialect", table.name, extra.name),
        ));
    }

    let expected_order = table
        .columns
        .iter()
        .map(|column| column.name.as_str())
        .filter(|name| actual.iter().any(|column| column.name == *name));
    let actual_order = actual
        .iter()
        .map(|column| column.name.as_str())
        .filter(|name| table.column(name).is_some());
    if !expected_order.eq(actual_order) {
        report.push(Violation::new(
            ViolationKind::ColumnMismatch,
            &table.name,
            format!("columns of {} are out of dialect order", table.name),
        ));
    }
}

fn check_metadata(
    conn: &Connection,
    dialect: &Dialect,
    report: &mut ValidationReport,
    properties_present: bool,
) -> Result<(), FoundryError> {
    if !properties_present {
        return Ok(());
    }
    for (key, expected) in &dialect.metadata {
        let actual = conn
            .query_row(
                &format!("SELECT value FROM {PROPERTIES_TABLE} WHERE key = ?1"),
                params![key],
                |row| row.get::<_, Value>(0),
            )
            .optional()
            .map_err(|err| sqlite_error(&err))?
            .and_then(|value| match value {
                Value::Text(text) => Some(text),
                Value::Integer(number) => Some(number.to_string()),
                Value::Real(number) => Some(number.to_string()),
                Value::Null | Value::Blob(_) => None,
            });
        if actual.as_deref() != Some(expected.as_str()) {
            report.push(Violation::new(
                ViolationKind::MetadataMismatch,
                PROPERTIES_TABLE,
                format!("{key} is {}, expected {expected}", actual.as_deref().unwrap_or("absent")),
            ));
        }
    }
    Ok(())
}

fn collect_rowids(conn: &Connection, sql: &str) -> Result<Vec<i64>, FoundryError> {
    let mut stmt = conn.prepare(sql).map_err(|err| sqlite_error(&err))?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0)).map_err(|err| sqlite_error(&err))?;
    let mut rowids = Vec::new();
    for row in rows {
        rowids.push(row.map_err(|err| sqlite_error(&err))?);
    }
    Ok(rowids)
}

fn check_foreign_key(
    conn: &Connection,
    edge: &ForeignKey,
    report: &mut ValidationReport,
) -> Result<(), FoundryError> {
    let child = quote(&edge.child_table);
    let child_column = quote(&edge.child_column);
    let sentinel = edge
        .sentinel
        .map(|value| format!(" AND c.{child_column} != {value}"))
        .unwrap_or_default();
    let sql = format!(
        "SELECT c.ROWID FROM {child} c
         WHERE c.{child_column} IS NOT NULL{sentinel}
           AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.{parent_column} = c.{child_column})
         ORDER BY c.ROWID",
        parent = quote(&edge.parent_table),
        parent_column = quote(&edge.parent_column),
    );
    let rowids = collect_rowids(conn, &sql)?;
    if !rowids.is_empty() {
        report.push(
            Violation::new(
                ViolationKind::ForeignKey,
                &edge.child_table,
                format!(
                    "{} row(s) of {}.{} reference no {}.{}",
                    rowids.len(),
                    edge.child_table,
                    edge.child_column,
                    edge.parent_table,
                    edge.parent_column
                ),
            )
            .with_rowids(rowids),
        );
    }
    Ok(())
}

fn check_unique(
    conn: &Connection,
    table: &str,
    key: &[String],
    report: &mut ValidationReport,
) -> Result<(), FoundryError> {
    let columns = key.iter().map(|column| quote(column)).collect::<Vec<_>>().join(", ");
    let not_null = key
        .iter()
        .map(|column| format!("{} IS NOT NULL", quote(column)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = format!(
        "SELECT group_concat(ROWID), COUNT(*) FROM {table_name} WHERE {not_null}
         GROUP BY {columns} HAVING COUNT(*) > 1",
        table_name = quote(table),
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| sqlite_error(&err))?;
    let groups = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|err| sqlite_error(&err))?;
    for group in groups {
        let (rowids, count) = group.map_err(|err| sqlite_error(&err))?;
        let rowids =
            rowids.split(',').filter_map(|value| value.trim().parse::<i64>().ok()).collect();
        report.push(
            Violation::new(
                ViolationKind::DuplicateKey,
                table,
                format!("{count} rows of {table} share ({})", key.join(", ")),
            )
            .with_rowids(rowids),
        );
    }
    Ok(())
}

fn check_required_join(
    conn: &Connection,
    join: &RequiredJoin,
    report: &mut ValidationReport,
) -> Result<(), FoundryError> {
    let sql = format!(
        "SELECT t.ROWID, COUNT(j.{column}) FROM {table} t
         LEFT JOIN {join_table} j ON j.{column} = t.ROWID
         GROUP BY t.ROWID ORDER BY t.ROWID",
        column = quote(&join.join_column),
        table = quote(&join.table),
        join_table = quote(&join.join_table),
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| sqlite_error(&err))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|err| sqlite_error(&err))?;

    let mut orphans = Vec::new();
    let mut shared = Vec::new();
    for row in rows {
        let (rowid, joins) = row.map_err(|err| sqlite_error(&err))?;
        if joins == 0 {
            orphans.push(rowid);
        } else if join.exactly_one && joins > 1 {
            shared.push(rowid);
        }
    }

    if !orphans.is_empty() {
        report.push(
            Violation::new(
                ViolationKind::OrphanRow,
                &join.table,
                format!(
                    "{} row(s) of {} are not linked through {}",
                    orphans.len(),
                    join.table,
                    join.join_table
                ),
            )
            .with_rowids(orphans),
        );
    }
    if !shared.is_empty() {
        report.push(
            Violation::new(
                ViolationKind::DuplicateKey,
                &join.table,
                format!(
                    "{} row(s) of {} are linked more than once through {}",
                    shared.len(),
                    join.table,
                    join.join_table
                ),
            )
            .with_rowids(shared),
        );
    }
    Ok(())
}

fn check_guid_shapes(
    conn: &Connection,
    table: &str,
    family: GuidFamily,
    report: &mut ValidationReport,
) -> Result<(), FoundryError> {
    let mut stmt = conn
        .prepare(&format!("SELECT ROWID, guid FROM {} ORDER BY ROWID", quote(table)))
        .map_err(|err| sqlite_error(&err))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Value>(1)?)))
        .map_err(|err| sqlite_error(&err))?;

    let mut malformed = Vec::new();
    for row in rows {
        let (rowid, guid) = row.map_err(|err| sqlite_error(&err))?;
        let shape = match &guid {
            Value::Text(text) => classify(text),
            _ => None,
        };
        if shape != Some(family) {
            malformed.push(rowid);
        }
    }
    if !malformed.is_empty() {
        report.push(
            Violation::new(
                ViolationKind::MalformedGuid,
                table,
                format!(
                    "{} {table} guid(s) do not have the {} shape",
                    malformed.len(),
                    family.as_str()
                ),
            )
            .with_rowids(malformed),
        );
    }
    Ok(())
}

fn check_timestamp_order(
    conn: &Connection,
    order_column: &str,
    report: &mut ValidationReport,
) -> Result<(), FoundryError> {
    let sql = format!(
        "SELECT j.chat_id, m.ROWID, m.date FROM chat_message_join j
         JOIN message m ON m.ROWID = j.message_id
         ORDER BY j.chat_id, m.{order}, m.ROWID",
        order = quote(order_column),
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| sqlite_error(&err))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, Value>(2)?))
        })
        .map_err(|err| sqlite_error(&err))?;

    let mut regressions: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    let mut untyped = Vec::new();
    let mut previous: Option<(i64, i64)> = None;
    for row in rows {
        let (chat_id, rowid, date) = row.map_err(|err| sqlite_error(&err))?;
        let date = match date {
            Value::Integer(date) => date,
            Value::Null => 0,
            _ => {
                untyped.push(rowid);
                continue;
            }
        };
        if let Some((previous_chat, previous_date)) = previous {
            if previous_chat == chat_id && date < previous_date {
                regressions.entry(chat_id).or_default().push(rowid);
            }
        }
        previous = Some((chat_id, date));
    }

    for (chat_id, rowids) in regressions {
        report.push(
            Violation::new(
                ViolationKind::TimestampOrder,
                "message",
                format!(
                    "{} message(s) in chat {chat_id} are dated before their predecessor",
                    rowids.len()
                ),
            )
            .with_rowids(rowids),
        );
    }
    if !untyped.is_empty() {
        report.push(
            Violation::new(
                ViolationKind::TimestampOrder,
                "message",
                format!("{} message date(s) are not integer native timestamps", untyped.len()),
            )
            .with_rowids(untyped),
        );
    }
    Ok(())
}
