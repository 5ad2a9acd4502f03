use crate::graph::DependencyGraph;
use model::schema::SchemaDescription;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// One execution tier: entities with no lookup dependencies except into
/// earlier tiers. Entities inside a tier import in parallel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier {
    pub number: usize,
    pub entities: Vec<String>,
}

/// The ordered import plan plus, per entity, the lookup attributes that must
/// be deferred to the second pass because they close a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportPlan {
    pub tiers: Vec<Tier>,
    pub deferred_fields: BTreeMap<String, BTreeSet<String>>,
}

impl ImportPlan {
    /// Plans an import from the archive's schema description.
    ///
    /// Self-loops and every edge inside a strongly connected component are
    /// turned into deferred fields on the edge's source entity; the residual
    /// graph is a DAG and is layered into tiers, leaves first. Ties inside a
    /// tier break on entity name.
    pub fn build(schema: &SchemaDescription) -> Self {
        let graph = DependencyGraph::from_schema(schema);
        let n = graph.node_count();

        let mut deferred_fields: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut defer = |entity: &str, fields: &[String]| {
            if fields.is_empty() {
                return;
            }
            deferred_fields
                .entry(entity.to_string())
                .or_default()
                .extend(fields.iter().cloned());
        };

        for node in 0..n {
            if graph.has_self_loop(node) {
                defer(graph.name(node), graph.fields_on_edge(node, node));
            }
        }

        // Intra-component edges are the back-edges that make the graph
        // cyclic; deferring their fields removes them from topology.
        let mut removed: HashSet<(usize, usize)> = HashSet::new();
        for component in graph.strongly_connected_components() {
            if component.len() < 2 {
                continue;
            }
            let members: HashSet<usize> = component.iter().copied().collect();
            for &from in &component {
                for to in graph.successors(from) {
                    if members.contains(&to) {
                        removed.insert((from, to));
                        defer(graph.name(from), graph.fields_on_edge(from, to));
                    }
                }
            }
        }

        let residual: Vec<Vec<usize>> = (0..n)
            .map(|from| {
                graph
                    .successors(from)
                    .filter(|&to| !removed.contains(&(from, to)))
                    .collect()
            })
            .collect();

        // Layer the DAG: a node is placeable once everything it points at is
        // already placed. Node order is name order, so tiers come out stable.
        let mut tier_of: Vec<Option<usize>> = vec![None; n];
        let mut tiers: Vec<Tier> = Vec::new();
        let mut placed = 0usize;
        while placed < n {
            let mut current: Vec<usize> = Vec::new();
            for node in 0..n {
                if tier_of[node].is_some() {
                    continue;
                }
                if residual[node].iter().all(|&to| tier_of[to].is_some()) {
                    current.push(node);
                }
            }
            if current.is_empty() {
                // Residual cycle; sweep the remainder into one final tier.
                current = (0..n).filter(|&v| tier_of[v].is_none()).collect();
            }
            let number = tiers.len() + 1;
            for &node in &current {
                tier_of[node] = Some(number);
            }
            placed += current.len();
            tiers.push(Tier {
                number,
                entities: current.iter().map(|&v| graph.name(v).to_string()).collect(),
            });
        }

        Self {
            tiers,
            deferred_fields,
        }
    }

    pub fn deferred_for(&self, entity: &str) -> Option<&BTreeSet<String>> {
        self.deferred_fields.get(entity)
    }

    pub fn is_deferred(&self, entity: &str, field: &str) -> bool {
        self.deferred_for(entity)
            .map(|fields| fields.contains(field))
            .unwrap_or(false)
    }

    pub fn tier_of(&self, entity: &str) -> Option<usize> {
        self.tiers
            .iter()
            .find(|t| t.entities.iter().any(|e| e == entity))
            .map(|t| t.number)
    }

    pub fn entity_count(&self) -> usize {
        self.tiers.iter().map(|t| t.entities.len()).sum()
    }

    pub fn hash(&self) -> String {
        let serialized =
            serde_json::to_string(self).expect("import plan serializes to JSON");
        format!("{:x}", md5::compute(serialized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::schema::EntitySchema;

    fn schema(entities: Vec<EntitySchema>) -> SchemaDescription {
        SchemaDescription { entities }
    }

    #[test]
    fn account_contact_cycle_defers_parent_lookup() {
        let s = schema(vec![
            EntitySchema::new("account").with_lookup("parentaccountid", "account"),
            EntitySchema::new("contact").with_lookup("parentcustomerid", "account"),
        ]);
        let plan = ImportPlan::build(&s);

        assert_eq!(plan.tiers.len(), 2);
        assert_eq!(plan.tiers[0].entities, vec!["account"]);
        assert_eq!(plan.tiers[1].entities, vec!["contact"]);
        assert!(plan.is_deferred("account", "parentaccountid"));
        assert!(!plan.is_deferred("contact", "parentcustomerid"));
    }

    #[test]
    fn mutual_cycle_collapses_into_one_tier() {
        let s = schema(vec![
            EntitySchema::new("invoice").with_lookup("quoteid", "quote"),
            EntitySchema::new("quote").with_lookup("invoiceid", "invoice"),
        ]);
        let plan = ImportPlan::build(&s);

        assert_eq!(plan.tiers.len(), 1);
        assert_eq!(plan.tiers[0].entities, vec!["invoice", "quote"]);
        assert!(plan.is_deferred("invoice", "quoteid"));
        assert!(plan.is_deferred("quote", "invoiceid"));
    }

    #[test]
    fn every_non_deferred_edge_points_at_an_earlier_tier() {
        let s = schema(vec![
            EntitySchema::new("businessunit")
                .with_lookup("parentbusinessunitid", "businessunit"),
            EntitySchema::new("team").with_lookup("businessunitid", "businessunit"),
            EntitySchema::new("account")
                .with_lookup("owningteam", "team")
                .with_lookup("parentaccountid", "account"),
            EntitySchema::new("contact")
                .with_lookup("parentcustomerid", "account")
                .with_lookup("employerid", "contact"),
            EntitySchema::new("opportunity")
                .with_lookup("customerid", "account")
                .with_lookup("contactid", "contact"),
        ]);
        let plan = ImportPlan::build(&s);

        assert_eq!(plan.entity_count(), 5);
        for entity in &s.entities {
            let from_tier = plan.tier_of(&entity.logical_name).unwrap();
            for (field, target) in entity.lookups() {
                if plan.is_deferred(&entity.logical_name, field) || !s.contains(target) {
                    continue;
                }
                let to_tier = plan.tier_of(target).unwrap();
                assert!(
                    from_tier > to_tier,
                    "{}.{field} -> {target}: tier {from_tier} !> {to_tier}",
                    entity.logical_name
                );
            }
        }
    }

    #[test]
    fn tier_ordering_is_stable_by_name() {
        let s = schema(vec![
            EntitySchema::new("zebra"),
            EntitySchema::new("apple"),
            EntitySchema::new("mango"),
        ]);
        let plan = ImportPlan::build(&s);
        assert_eq!(plan.tiers.len(), 1);
        assert_eq!(plan.tiers[0].entities, vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn plan_hash_is_deterministic() {
        let s = schema(vec![
            EntitySchema::new("account").with_lookup("parentaccountid", "account"),
        ]);
        let a = ImportPlan::build(&s);
        let b = ImportPlan::build(&s);
        assert_eq!(a.hash(), b.hash());
    }
}
