use crate::core::{reference::EntityReference, value::Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single named attribute on a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub name: String,
    pub value: Value,
}

impl AttributeValue {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One archived record: logical name, primary-key id and an ordered
/// attribute list. Order is preserved so per-record errors can be indexed
/// back into the batch that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: String,
    pub id: Uuid,
    pub attributes: Vec<AttributeValue>,
}

impl EntityRecord {
    pub fn new(entity: impl Into<String>, id: Uuid) -> Self {
        Self {
            entity: entity.into(),
            id,
            attributes: Vec::new(),
        }
    }

    /// Name of the attribute that doubles as the primary key, `<entity>id`.
    pub fn primary_key_attribute(&self) -> String {
        format!("{}id", self.entity)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| &a.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces an existing attribute in place or appends a new one,
    /// preserving the original ordering of untouched attributes.
    pub fn set(&mut self, name: &str, value: Value) {
        match self
            .attributes
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(name))
        {
            Some(attr) => attr.value = value,
            None => self.attributes.push(AttributeValue::new(name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self
            .attributes
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))?;
        Some(self.attributes.remove(idx).value)
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &Value) -> bool,
    {
        self.attributes.retain(|a| keep(&a.name, &a.value));
    }

    /// Iterates the reference-typed attributes with their names.
    pub fn references(&self) -> impl Iterator<Item = (&str, &EntityReference)> {
        self.attributes.iter().filter_map(|a| match &a.value {
            Value::Reference(r) => Some((a.name.as_str(), r)),
            _ => None,
        })
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_in_place_and_appends_at_end() {
        let id = Uuid::new_v4();
        let mut record = EntityRecord::new("account", id)
            .with_attribute("name", Value::from("Contoso"))
            .with_attribute("revenue", Value::Int(10));

        record.set("name", Value::from("Fabrikam"));
        record.set("city", Value::from("Oslo"));

        let names: Vec<&str> = record.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["name", "revenue", "city"]);
        assert_eq!(record.get("NAME"), Some(&Value::from("Fabrikam")));
    }

    #[test]
    fn references_yields_only_lookups() {
        let parent = EntityReference::new("account", Uuid::new_v4());
        let record = EntityRecord::new("contact", Uuid::new_v4())
            .with_attribute("fullname", Value::from("Ada"))
            .with_attribute("parentcustomerid", parent.clone().into());

        let refs: Vec<_> = record.references().collect();
        assert_eq!(refs, vec![("parentcustomerid", &parent)]);
    }

    #[test]
    fn primary_key_attribute_appends_id_suffix() {
        let record = EntityRecord::new("team", Uuid::new_v4());
        assert_eq!(record.primary_key_attribute(), "teamid");
    }
}
