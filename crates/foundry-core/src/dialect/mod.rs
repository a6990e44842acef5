//! Declarative schema dialects.
//!
//! A dialect is data: an optional base dialect plus an ordered override list.
//! Resolution replays the base chain root-first and yields a flat [`Dialect`]
//! that can be rendered to SQL, validated against, or diffed with any other
//! dialect.

mod catalog;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::FoundryError;

/// Dialect chosen when the host gives no version signal.
pub const DEFAULT_DIALECT: &str = "sequoia";

pub const PROPERTIES_TABLE: &str = "_SqliteDatabaseProperties";
pub const CLIENT_VERSION_KEY: &str = "_ClientVersion";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Integer,
    Text,
    Blob,
    Real,
}

impl ColumnType {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
            Self::Real => "REAL",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INTEGER" => Some(Self::Integer),
            "TEXT" => Some(Self::Text),
            "BLOB" => Some(Self::Blob),
            "REAL" => Some(Self::Real),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ColumnReference {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// `INTEGER PRIMARY KEY AUTOINCREMENT`.
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub references: Option<ColumnReference>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    #[must_use]
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
            references: None,
        }
    }

    #[must_use]
    pub fn rowid() -> Self {
        Self { primary_key: true, ..Self::new("ROWID", ColumnType::Integer) }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: &str) -> Self {
        self.default = Some(value.to_string());
        self
    }

    #[must_use]
    pub fn references(mut self, table: &str, column: &str) -> Self {
        self.references =
            Some(ColumnReference { table: table.to_string(), column: column.to_string() });
        self
    }

    fn render(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.column_type.as_sql());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY AUTOINCREMENT");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            let _ = write!(sql, " DEFAULT {default}");
        }
        if let Some(reference) = &self.references {
            let _ = write!(
                sql,
                " REFERENCES {} ({}) ON DELETE CASCADE",
                reference.table, reference.column
            );
        }
        sql
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum TableConstraint {
    Unique(Vec<String>),
    PrimaryKey(Vec<String>),
    Check(String),
}

impl TableConstraint {
    fn render(&self) -> String {
        match self {
            Self::Unique(columns) => format!("UNIQUE ({})", columns.join(", ")),
            Self::PrimaryKey(columns) => format!("PRIMARY KEY ({})", columns.join(", ")),
            Self::Check(expression) => format!("CHECK ({expression})"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub constraints: Vec<TableConstraint>,
}

impl TableSpec {
    #[must_use]
    pub fn new(name: &str, columns: Vec<ColumnSpec>) -> Self {
        Self { name: name.to_string(), columns, constraints: Vec::new() }
    }

    #[must_use]
    pub fn with_column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: TableConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|column| column.name == name)
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    /// Column sets that must be unique across rows, excluding the rowid alias.
    #[must_use]
    pub fn unique_keys(&self) -> Vec<Vec<String>> {
        let mut keys = self
            .columns
            .iter()
            .filter(|column| column.unique && !column.primary_key)
            .map(|column| vec![column.name.clone()])
            .collect::<Vec<_>>();
        for constraint in &self.constraints {
            if let TableConstraint::Unique(columns) | TableConstraint::PrimaryKey(columns) =
                constraint
            {
                keys.push(columns.clone());
            }
        }
        keys
    }

    #[must_use]
    pub fn create_sql(&self) -> String {
        let mut lines = self.columns.iter().map(ColumnSpec::render).collect::<Vec<_>>();
        lines.extend(self.constraints.iter().map(TableConstraint::render));
        format!("CREATE TABLE {} (\n    {}\n)", self.name, lines.join(",\n    "))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
}

impl IndexSpec {
    #[must_use]
    pub fn new(name: &str, table: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|column| (*column).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn create_sql(&self) -> String {
        format!("CREATE INDEX {} ON {}({})", self.name, self.table, self.columns.join(", "))
    }
}

/// A child-to-parent edge checked by the validator. Declared edges are also
/// rendered as `REFERENCES` clauses; logical edges exist only as data.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ForeignKey {
    pub child_table: String,
    pub child_column: String,
    pub parent_table: String,
    pub parent_column: String,
    pub declared: bool,
    /// Child value meaning "no parent", e.g. `handle_id = 0` for owner messages.
    #[serde(default)]
    pub sentinel: Option<i64>,
}

impl ForeignKey {
    #[must_use]
    pub fn logical(child: (&str, &str), parent: (&str, &str), sentinel: Option<i64>) -> Self {
        Self {
            child_table: child.0.to_string(),
            child_column: child.1.to_string(),
            parent_table: parent.0.to_string(),
            parent_column: parent.1.to_string(),
            declared: false,
            sentinel,
        }
    }
}

/// Every row of `table` must appear in `join_table.join_column`; with
/// `exactly_one`, it must appear once.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequiredJoin {
    pub table: String,
    pub join_table: String,
    pub join_column: String,
    pub exactly_one: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum DialectOverride {
    AddTable { table: TableSpec },
    DropTable { table: String },
    AddColumn { table: String, column: ColumnSpec, after: Option<String> },
    DropColumn { table: String, column: String },
    ReplaceColumn { table: String, column: ColumnSpec },
    AddIndex { index: IndexSpec },
    DropIndex { name: String },
    AddForeignKey { foreign_key: ForeignKey },
    AddRequiredJoin { join: RequiredJoin },
    SetMetadata { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DialectDefinition {
    pub name: String,
    pub macos_major: u16,
    pub base: Option<String>,
    pub overrides: Vec<DialectOverride>,
}

/// A fully resolved, immutable dialect.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Dialect {
    pub name: String,
    pub macos_major: u16,
    pub base: Option<String>,
    pub tables: Vec<TableSpec>,
    pub indexes: Vec<IndexSpec>,
    pub logical_foreign_keys: Vec<ForeignKey>,
    pub required_joins: Vec<RequiredJoin>,
    pub metadata: BTreeMap<String, String>,
}

impl Dialect {
    fn empty(definition: &DialectDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            macos_major: definition.macos_major,
            base: definition.base.clone(),
            tables: Vec::new(),
            indexes: Vec::new(),
            logical_foreign_keys: Vec::new(),
            required_joins: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|table| table.name == name)
    }

    #[must_use]
    pub fn client_version(&self) -> Option<&str> {
        self.metadata.get(CLIENT_VERSION_KEY).map(String::as_str)
    }

    /// Declared edges (from column references) followed by logical edges.
    #[must_use]
    pub fn foreign_keys(&self) -> Vec<ForeignKey> {
        let mut edges = Vec::new();
        for table in &self.tables {
            for column in &table.columns {
                if let Some(reference) = &column.references {
                    edges.push(ForeignKey {
                        child_table: table.name.clone(),
                        child_column: column.name.clone(),
                        parent_table: reference.table.clone(),
                        parent_column: reference.column.clone(),
                        declared: true,
                        sentinel: None,
                    });
                }
            }
        }
        edges.extend(self.logical_foreign_keys.iter().cloned());
        edges
    }

    /// `CREATE TABLE` statements in definition order followed by indexes.
    #[must_use]
    pub fn schema_sql(&self) -> Vec<String> {
        self.tables
            .iter()
            .map(TableSpec::create_sql)
            .chain(self.indexes.iter().map(IndexSpec::create_sql))
            .collect()
    }

    #[must_use]
    pub fn diff(&self, other: &Self) -> DialectDiff {
        let ours = self.tables.iter().map(|table| table.name.as_str()).collect::<BTreeSet<_>>();
        let theirs = other.tables.iter().map(|table| table.name.as_str()).collect::<BTreeSet<_>>();

        let added_tables = theirs.difference(&ours).map(|name| (*name).to_string()).collect();
        let removed_tables = ours.difference(&theirs).map(|name| (*name).to_string()).collect();

        let mut changed_tables = Vec::new();
        for table in &self.tables {
            let Some(counterpart) = other.table(&table.name) else {
                continue;
            };
            let table_diff = TableDiff::between(table, counterpart);
            if !table_diff.is_empty() {
                changed_tables.push(table_diff);
            }
        }

        let our_indexes =
            self.indexes.iter().map(|index| index.name.as_str()).collect::<BTreeSet<_>>();
        let their_indexes =
            other.indexes.iter().map(|index| index.name.as_str()).collect::<BTreeSet<_>>();

        let keys = self.metadata.keys().chain(other.metadata.keys()).collect::<BTreeSet<_>>();
        let metadata_changes = keys
            .into_iter()
            .filter_map(|key| {
                let from = self.metadata.get(key).cloned();
                let to = other.metadata.get(key).cloned();
                (from != to).then(|| MetadataChange { key: key.clone(), from, to })
            })
            .collect();

        DialectDiff {
            from: self.name.clone(),
            to: other.name.clone(),
            added_tables,
            removed_tables,
            changed_tables,
            added_indexes: their_indexes
                .difference(&our_indexes)
                .map(|name| (*name).to_string())
                .collect(),
            removed_indexes: our_indexes
                .difference(&their_indexes)
                .map(|name| (*name).to_string())
                .collect(),
            metadata_changes,
        }
    }

    fn apply(&mut self, override_op: &DialectOverride) -> Result<(), String> {
        match override_op {
            DialectOverride::AddTable { table } => {
                if self.table(&table.name).is_some() {
                    return Err(format!("table {} already exists", table.name));
                }
                self.tables.push(table.clone());
            }
            DialectOverride::DropTable { table } => {
                let before = self.tables.len();
                self.tables.retain(|candidate| candidate.name != *table);
                if self.tables.len() == before {
                    return Err(format!("cannot drop missing table {table}"));
                }
                self.indexes.retain(|index| index.table != *table);
                self.logical_foreign_keys
                    .retain(|edge| edge.child_table != *table && edge.parent_table != *table);
                self.required_joins
                    .retain(|join| join.table != *table && join.join_table != *table);
            }
            DialectOverride::AddColumn { table, column, after } => {
                let spec = self.table_mut(table)?;
                if spec.column(&column.name).is_some() {
                    return Err(format!("column {table}.{} already exists", column.name));
                }
                let position = match after {
                    Some(anchor) => {
                        spec.columns
                            .iter()
                            .position(|candidate| candidate.name == *anchor)
                            .ok_or_else(|| {
                                format!("anchor column {table}.{anchor} does not exist")
                            })?
                            + 1
                    }
                    None => spec.columns.len(),
                };
                spec.columns.insert(position, column.clone());
            }
            DialectOverride::DropColumn { table, column } => {
                let spec = self.table_mut(table)?;
                let before = spec.columns.len();
                spec.columns.retain(|candidate| candidate.name != *column);
                if spec.columns.len() == before {
                    return Err(format!("cannot drop missing column {table}.{column}"));
                }
            }
            DialectOverride::ReplaceColumn { table, column } => {
                let spec = self.table_mut(table)?;
                let slot = spec
                    .columns
                    .iter_mut()
                    .find(|candidate| candidate.name == column.name)
                    .ok_or_else(|| {
                        format!("cannot replace missing column {table}.{}", column.name)
                    })?;
                *slot = column.clone();
            }
            DialectOverride::AddIndex { index } => {
                if self.indexes.iter().any(|existing| existing.name == index.name) {
                    return Err(format!("index {} already exists", index.name));
                }
                self.indexes.push(index.clone());
            }
            DialectOverride::DropIndex { name } => {
                let before = self.indexes.len();
                self.indexes.retain(|index| index.name != *name);
                if self.indexes.len() == before {
                    return Err(format!("cannot drop missing index {name}"));
                }
            }
            DialectOverride::AddForeignKey { foreign_key } => {
                self.logical_foreign_keys.push(foreign_key.clone());
            }
            DialectOverride::AddRequiredJoin { join } => {
                self.required_joins.push(join.clone());
            }
            DialectOverride::SetMetadata { key, value } => {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableSpec, String> {
        self.tables
            .iter_mut()
            .find(|table| table.name == name)
            .ok_or_else(|| format!("table {name} does not exist"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableDiff {
    pub table: String,
    pub added_columns: Vec<String>,
    pub removed_columns: Vec<String>,
    pub changed_columns: Vec<String>,
    /// Shared columns appear in a different relative order.
    pub reordered: bool,
}

impl TableDiff {
    fn between(from: &TableSpec, to: &TableSpec) -> Self {
        let added_columns = to
            .columns
            .iter()
            .filter(|column| from.column(&column.name).is_none())
            .map(|column| column.name.clone())
            .collect();
        let removed_columns = from
            .columns
            .iter()
            .filter(|column| to.column(&column.name).is_none())
            .map(|column| column.name.clone())
            .collect();
        let changed_columns = from
            .columns
            .iter()
            .filter(|column| to.column(&column.name).is_some_and(|other| other != *column))
            .map(|column| column.name.clone())
            .collect();

        let shared_from = from.column_names().into_iter().filter(|name| to.column(name).is_some());
        let shared_to = to.column_names().into_iter().filter(|name| from.column(name).is_some());
        let reordered = !shared_from.eq(shared_to);

        Self {
            table: from.name.clone(),
            added_columns,
            removed_columns,
            changed_columns,
            reordered,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.changed_columns.is_empty()
            && !self.reordered
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetadataChange {
    pub key: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DialectDiff {
    pub from: String,
    pub to: String,
    pub added_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    pub changed_tables: Vec<TableDiff>,
    pub added_indexes: Vec<String>,
    pub removed_indexes: Vec<String>,
    pub metadata_changes: Vec<MetadataChange>,
}

impl DialectDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.changed_tables.is_empty()
            && self.added_indexes.is_empty()
            && self.removed_indexes.is_empty()
            && self.metadata_changes.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DialectSummary {
    pub name: String,
    pub macos_major: u16,
    pub base: Option<String>,
    pub client_version: Option<String>,
    pub tables: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DialectRegistry {
    definitions: BTreeMap<String, DialectDefinition>,
}

impl DialectRegistry {
    /// Registry holding the built-in `sonoma`, `sequoia`, and `tahoe` dialects.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for definition in catalog::definitions() {
            registry.register(definition);
        }
        registry
    }

    pub fn register(&mut self, definition: DialectDefinition) {
        self.definitions.insert(definition.name.to_lowercase(), definition);
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    /// Resolve a dialect name (`"sequoia"`) or macOS version (`"15.1"`).
    ///
    /// # Errors
    /// Returns [`FoundryError::UnknownDialect`] for unrecognized tags and for
    /// definitions whose base chain or overrides are inconsistent.
    pub fn resolve(&self, tag: &str) -> Result<Dialect, FoundryError> {
        let normalized = tag.trim().to_lowercase();
        if self.definitions.contains_key(&normalized) {
            return self.resolve_name(&normalized);
        }
        if let Some(name) = self.name_for_macos_version(&normalized) {
            return self.resolve_name(&name);
        }
        Err(FoundryError::UnknownDialect(tag.to_string()))
    }

    /// Pick the dialect for a host OS version string. An absent signal
    /// selects [`DEFAULT_DIALECT`]; an unmapped version is an error.
    ///
    /// # Errors
    /// Returns [`FoundryError::UnknownDialect`] when the host version maps to no dialect.
    pub fn detect_host(&self, host_version: Option<&str>) -> Result<Dialect, FoundryError> {
        match host_version.map(str::trim).filter(|value| !value.is_empty()) {
            Some(version) => self
                .name_for_macos_version(version)
                .ok_or_else(|| FoundryError::UnknownDialect(format!("macOS {version}")))
                .and_then(|name| self.resolve_name(&name)),
            None => self.resolve_name(DEFAULT_DIALECT),
        }
    }

    /// # Errors
    /// Returns [`FoundryError::UnknownDialect`] when any registered dialect fails to resolve.
    pub fn summaries(&self) -> Result<Vec<DialectSummary>, FoundryError> {
        self.definitions
            .keys()
            .map(|name| {
                let dialect = self.resolve_name(name)?;
                Ok(DialectSummary {
                    client_version: dialect.client_version().map(str::to_string),
                    tables: dialect.tables.len(),
                    name: dialect.name,
                    macos_major: dialect.macos_major,
                    base: dialect.base,
                })
            })
            .collect()
    }

    fn name_for_macos_version(&self, version: &str) -> Option<String> {
        let major = version.split('.').next()?.parse::<u16>().ok()?;
        self.definitions
            .values()
            .find(|definition| definition.macos_major == major)
            .map(|definition| definition.name.to_lowercase())
    }

    fn resolve_name(&self, name: &str) -> Result<Dialect, FoundryError> {
        let mut chain = Vec::new();
        let mut cursor = Some(name.to_lowercase());
        while let Some(current) = cursor {
            if chain.len() > self.definitions.len() {
                return Err(FoundryError::UnknownDialect(format!(
                    "{name}: base chain contains a cycle"
                )));
            }
            let definition = self.definitions.get(&current).ok_or_else(|| {
                if chain.is_empty() {
                    FoundryError::UnknownDialect(name.to_string())
                } else {
                    FoundryError::UnknownDialect(format!("{name}: missing base dialect {current}"))
                }
            })?;
            cursor = definition.base.as_ref().map(|base| base.to_lowercase());
            chain.push(definition);
        }

        let Some(leaf) = chain.first() else {
            return Err(FoundryError::UnknownDialect(name.to_string()));
        };
        let mut dialect = Dialect::empty(leaf);
        for definition in chain.iter().rev() {
            for override_op in &definition.overrides {
                dialect.apply(override_op).map_err(|detail| {
                    FoundryError::UnknownDialect(format!("{}: {detail}", definition.name))
                })?;
            }
        }
        Ok(dialect)
    }
}

/// Resolve a tag against the built-in registry.
///
/// # Errors
/// Returns [`FoundryError::UnknownDialect`] for unrecognized tags.
pub fn resolve_dialect(tag: &str) -> Result<Dialect, FoundryError> {
    DialectRegistry::builtin().resolve(tag)
}
