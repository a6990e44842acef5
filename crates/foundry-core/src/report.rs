//! Structured output of artifact validation.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MissingTable,
    MissingColumn,
    ColumnMismatch,
    ForeignKey,
    DuplicateKey,
    OrphanRow,
    MalformedGuid,
    MetadataMismatch,
    TimestampOrder,
}

impl ViolationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingTable => "missing_table",
            Self::MissingColumn => "missing_column",
            Self::ColumnMismatch => "column_mismatch",
            Self::ForeignKey => "foreign_key",
            Self::DuplicateKey => "duplicate_key",
            Self::OrphanRow => "orphan_row",
            Self::MalformedGuid => "malformed_guid",
            Self::MetadataMismatch => "metadata_mismatch",
            Self::TimestampOrder => "timestamp_order",
        }
    }

    /// Shape and consistency heuristics are advisory; structural breaks are not.
    #[must_use]
    pub fn default_severity(self) -> Severity {
        match self {
            Self::MalformedGuid | Self::MetadataMismatch | Self::TimestampOrder => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }
}

impl Display for ViolationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub table: String,
    /// Offending row ids, when the violation is row-scoped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rowids: Vec<i64>,
    pub detail: String,
}

impl Violation {
    #[must_use]
    pub fn new(kind: ViolationKind, table: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            table: table.into(),
            rowids: Vec::new(),
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn with_rowids(mut self, rowids: Vec<i64>) -> Self {
        self.rowids = rowids;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationReport {
    pub dialect: String,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    #[must_use]
    pub fn new(dialect: impl Into<String>) -> Self {
        Self { dialect: dialect.into(), violations: Vec::new() }
    }

    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    /// No violations of any severity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|violation| violation.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|violation| violation.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|violation| violation.severity == Severity::Warning)
    }

    #[must_use]
    pub fn count_of(&self, kind: ViolationKind) -> usize {
        self.violations.iter().filter(|violation| violation.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_split_errors_from_warnings() {
        let mut report = ValidationReport::new("sequoia");
        assert!(report.is_valid());
        report.push(
            Violation::new(ViolationKind::TimestampOrder, "message", "date regresses")
                .with_rowids(vec![4]),
        );
        assert!(!report.is_valid());
        assert!(!report.has_errors());
        report.push(Violation::new(
            ViolationKind::ForeignKey,
            "chat_message_join",
            "dangling message_id",
        ));
        assert!(report.has_errors());
        assert_eq!(report.errors().count(), 1);
        assert_eq!(report.warnings().count(), 1);
        assert_eq!(report.count_of(ViolationKind::ForeignKey), 1);
    }

    #[test]
    fn violations_serialize_with_snake_case_kinds() -> Result<(), serde_json::Error> {
        let violation =
            Violation::new(ViolationKind::DuplicateKey, "handle", "id, service repeated");
        let json = serde_json::to_value(&violation)?;
        assert_eq!(json["kind"], "duplicate_key");
        assert_eq!(json["severity"], "error");
        assert!(json.get("rowids").is_none());
        Ok(())
    }
}
