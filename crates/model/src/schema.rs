use serde::{Deserialize, Serialize};

/// Schema description shipped inside an exported archive: one entry per
/// entity type, with attribute-level lookup targets and many-to-many
/// relationship descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub entities: Vec<EntitySchema>,
}

impl SchemaDescription {
    pub fn entity(&self, logical_name: &str) -> Option<&EntitySchema> {
        self.entities
            .iter()
            .find(|e| e.logical_name == logical_name)
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|e| e.logical_name.as_str())
    }

    pub fn contains(&self, logical_name: &str) -> bool {
        self.entity(logical_name).is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySchema {
    pub logical_name: String,
    pub primary_key: String,
    pub object_type_code: Option<i32>,
    #[serde(default)]
    pub disable_plugins: bool,
    pub attributes: Vec<AttributeSchema>,
    #[serde(default)]
    pub relationships: Vec<RelationshipSchema>,
}

impl EntitySchema {
    pub fn new(logical_name: impl Into<String>) -> Self {
        let logical_name = logical_name.into();
        Self {
            primary_key: format!("{logical_name}id"),
            logical_name,
            object_type_code: None,
            disable_plugins: false,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Iterates the lookup attributes that carry a target entity.
    pub fn lookups(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|a| {
            if !a.is_lookup {
                return None;
            }
            a.target_entity
                .as_deref()
                .map(|target| (a.name.as_str(), target))
        })
    }

    pub fn with_lookup(mut self, name: &str, target: &str) -> Self {
        self.attributes.push(AttributeSchema {
            name: name.to_string(),
            is_lookup: true,
            target_entity: Some(target.to_string()),
        });
        self
    }

    pub fn with_attribute(mut self, name: &str) -> Self {
        self.attributes.push(AttributeSchema {
            name: name.to_string(),
            is_lookup: false,
            target_entity: None,
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub name: String,
    #[serde(default)]
    pub is_lookup: bool,
    #[serde(default)]
    pub target_entity: Option<String>,
}

/// Descriptor of a many-to-many relationship and its intersect entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSchema {
    pub schema_name: String,
    pub intersect_entity: String,
    pub entity1: String,
    pub entity2: String,
}

/// Per-attribute write validity as advertised by the target tenant.
/// An attribute with no entry is treated as "unknown, include it".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValidity {
    pub valid_for_create: bool,
    pub valid_for_update: bool,
}
