//! The FactBag: append-only, copy-on-write fact storage.
//!
//! Facts accumulate monotonically within one query branch: once added, a fact
//! is never removed or mutated. Branching (`branch`) snapshots the current
//! facts cheaply — the snapshot holds `Arc`s to the same instances — after
//! which parent and child diverge independently. Concurrent branches never
//! observe each other's additions, which is what lets projection fan out one
//! branch per collection item without locks around shared state.
//!
//! Adding an enum fact also adds the facts its declared synonyms imply, so a
//! value of `banking.CountryCode = "DE"` can immediately satisfy a search for
//! `isoCodes.Alpha2` when the schema declares them synonymous.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use weft_schema::{Provenance, QualifiedName, Schema, TypedInstance};

/// How deep a fact lookup searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactLookup {
    /// Only facts added directly to the bag.
    TopLevelOnly,
    /// Breadth-first through object attributes and collection items; a match
    /// counts only when exactly one *distinct* value is found, so ambiguous
    /// data never silently picks a winner.
    AnyDepthExpectOneDistinct,
}

#[derive(Clone)]
pub struct FactBag {
    schema: Arc<Schema>,
    facts: Arc<RwLock<Vec<Arc<TypedInstance>>>>,
}

impl FactBag {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            facts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_facts(
        schema: Arc<Schema>,
        facts: impl IntoIterator<Item = TypedInstance>,
    ) -> Self {
        let bag = Self::new(schema);
        for fact in facts {
            bag.add(fact);
        }
        bag
    }

    /// An isolated branch seeded with a snapshot of the current facts.
    pub fn branch(&self) -> FactBag {
        let snapshot = self.facts.read().clone();
        FactBag {
            schema: Arc::clone(&self.schema),
            facts: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// A branch holding only the given fact (plus its synonyms). Used when
    /// projecting a single collection item.
    pub fn only(&self, fact: TypedInstance) -> FactBag {
        let bag = FactBag::new(Arc::clone(&self.schema));
        bag.add(fact);
        bag
    }

    pub fn is_empty(&self) -> bool {
        self.facts.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.facts.read().len()
    }

    /// Top-level facts, in insertion order.
    pub fn root_facts(&self) -> Vec<Arc<TypedInstance>> {
        self.facts.read().clone()
    }

    /// Adds a fact (deduplicated by value equality) and any synonym facts it
    /// implies. Returns whether the bag changed.
    pub fn add(&self, fact: TypedInstance) -> bool {
        let mut derived = Vec::new();
        self.collect_synonyms(&fact, &mut derived);

        let mut facts = self.facts.write();
        let mut changed = false;
        for instance in std::iter::once(fact).chain(derived) {
            if !facts.iter().any(|existing| **existing == instance) {
                debug!(fact_type = %instance.type_name(), "added fact");
                facts.push(Arc::new(instance));
                changed = true;
            }
        }
        changed
    }

    pub fn add_all(&self, facts: impl IntoIterator<Item = TypedInstance>) {
        for fact in facts {
            self.add(fact);
        }
    }

    pub fn has_fact_of_type(&self, type_name: &QualifiedName, lookup: FactLookup) -> bool {
        self.get_fact(type_name, lookup).is_some()
    }

    /// Finds a fact assignable to `type_name` under the given lookup mode.
    pub fn get_fact(&self, type_name: &QualifiedName, lookup: FactLookup) -> Option<TypedInstance> {
        match lookup {
            FactLookup::TopLevelOnly => self
                .facts
                .read()
                .iter()
                .find(|fact| self.matches(fact.type_name(), type_name) && fact.is_populated())
                .map(|fact| (**fact).clone()),
            FactLookup::AnyDepthExpectOneDistinct => {
                let mut matches: Vec<TypedInstance> = Vec::new();
                let mut queue: VecDeque<TypedInstance> = self
                    .facts
                    .read()
                    .iter()
                    .map(|fact| (**fact).clone())
                    .collect();
                while let Some(fact) = queue.pop_front() {
                    if self.matches(fact.type_name(), type_name)
                        && fact.is_populated()
                        && !matches.contains(&fact)
                    {
                        matches.push(fact.clone());
                    }
                    match &fact {
                        TypedInstance::Object { fields, .. } => {
                            queue.extend(fields.values().cloned());
                        }
                        TypedInstance::Collection { items, .. } => {
                            queue.extend(items.iter().cloned());
                        }
                        _ => {}
                    }
                }
                if matches.len() == 1 {
                    matches.pop()
                } else {
                    None
                }
            }
        }
    }

    /// All top-level facts assignable to `type_name`, in insertion order.
    pub fn all_facts_of_type(&self, type_name: &QualifiedName) -> Vec<TypedInstance> {
        self.facts
            .read()
            .iter()
            .filter(|fact| self.matches(fact.type_name(), type_name))
            .map(|fact| (**fact).clone())
            .collect()
    }

    fn matches(&self, fact_type: &QualifiedName, wanted: &QualifiedName) -> bool {
        if fact_type == wanted {
            return true;
        }
        // Unknown fact types can't participate in inheritance matching.
        self.schema
            .is_assignable(fact_type, wanted)
            .unwrap_or(false)
    }

    fn collect_synonyms(&self, fact: &TypedInstance, out: &mut Vec<TypedInstance>) {
        match fact {
            TypedInstance::Value { type_name, value, .. } => {
                let Ok(ty) = self.schema.type_named(type_name) else {
                    return;
                };
                if !ty.is_enum() {
                    return;
                }
                let Some(name) = value.as_str() else { return };
                let Some(enum_value) = ty.enum_value(name) else {
                    return;
                };
                for synonym in &enum_value.synonyms {
                    out.push(TypedInstance::value(
                        synonym.enum_type.clone(),
                        synonym.value.clone(),
                        Provenance::MappedSynonym {
                            from_type: type_name.clone(),
                        },
                    ));
                }
            }
            TypedInstance::Object { fields, .. } => {
                for field in fields.values() {
                    self.collect_synonyms(field, out);
                }
            }
            _ => {}
        }
    }
}
