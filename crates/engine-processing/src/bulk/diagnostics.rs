use lazy_static::lazy_static;
use model::records::record::EntityRecord;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

lazy_static! {
    /// Record identifiers as they appear in server fault text, e.g.
    /// `... With Ids = 0f6cbad4-...` or `Id = 7d29a5e2-...`.
    static ref FAULT_IDS: Regex =
        Regex::new(r"(?:With )?Ids? = ([0-9a-fA-F-]{36})").expect("fault id pattern");
}

/// What a referenced identifier in a fault turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReferencePattern {
    /// The record points at itself.
    SelfReference,
    /// The record points at another record of the same batch.
    SameBatchReference,
    /// The record points at something the target does not have.
    MissingReference,
}

impl ReferencePattern {
    pub fn suggestion(&self) -> &'static str {
        match self {
            ReferencePattern::SelfReference => {
                "self-referencing lookup; the field should be deferred to the second pass"
            }
            ReferencePattern::SameBatchReference => {
                "reference into the same batch; records in one batch cannot see each other, \
                 lower the batch size or defer the field"
            }
            ReferencePattern::MissingReference => {
                "referenced record does not exist in the target; check tier ordering and \
                 earlier failures"
            }
        }
    }
}

/// One finding of the failed-batch post-mortem.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDiagnostic {
    pub record_index: usize,
    pub field_name: String,
    pub referenced_id: Uuid,
    pub pattern: ReferencePattern,
    pub suggestion: &'static str,
}

/// Extracts the identifiers named in a fault message and scans the batch for
/// reference attributes pointing at them, classifying each hit.
pub fn analyze_batch_failure(batch: &[EntityRecord], message: &str) -> Vec<BatchDiagnostic> {
    let fault_ids: HashSet<Uuid> = FAULT_IDS
        .captures_iter(message)
        .filter_map(|c| c.get(1))
        .filter_map(|m| Uuid::parse_str(m.as_str()).ok())
        .collect();
    if fault_ids.is_empty() {
        return Vec::new();
    }

    let batch_ids: HashSet<Uuid> = batch.iter().map(|r| r.id).collect();

    let mut findings = Vec::new();
    for (record_index, record) in batch.iter().enumerate() {
        for (field_name, reference) in record.references() {
            if !fault_ids.contains(&reference.id) {
                continue;
            }
            let pattern = if reference.id == record.id {
                ReferencePattern::SelfReference
            } else if batch_ids.contains(&reference.id) {
                ReferencePattern::SameBatchReference
            } else {
                ReferencePattern::MissingReference
            };
            findings.push(BatchDiagnostic {
                record_index,
                field_name: field_name.to_string(),
                referenced_id: reference.id,
                pattern,
                suggestion: pattern.suggestion(),
            });
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::core::{reference::EntityReference, value::Value};

    fn record_with_ref(entity: &str, id: Uuid, field: &str, target: EntityReference) -> EntityRecord {
        EntityRecord::new(entity, id).with_attribute(field, Value::Reference(target))
    }

    #[test]
    fn classifies_all_three_patterns() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let missing = Uuid::new_v4();

        let batch = vec![
            record_with_ref("account", a, "parentaccountid", EntityReference::new("account", a)),
            record_with_ref("account", b, "parentaccountid", EntityReference::new("account", a)),
            record_with_ref("account", Uuid::new_v4(), "primarycontactid", EntityReference::new("contact", missing)),
        ];

        let message = format!(
            "account With Ids = {a} Do Not Exist; contact With Id = {missing} Does Not Exist"
        );
        let findings = analyze_batch_failure(&batch, &message);

        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].pattern, ReferencePattern::SelfReference);
        assert_eq!(findings[0].record_index, 0);
        assert_eq!(findings[1].pattern, ReferencePattern::SameBatchReference);
        assert_eq!(findings[1].record_index, 1);
        assert_eq!(findings[2].pattern, ReferencePattern::MissingReference);
        assert_eq!(findings[2].field_name, "primarycontactid");
    }

    #[test]
    fn message_without_ids_yields_nothing() {
        let batch = vec![EntityRecord::new("account", Uuid::new_v4())];
        assert!(analyze_batch_failure(&batch, "generic SQL error").is_empty());
    }
}
