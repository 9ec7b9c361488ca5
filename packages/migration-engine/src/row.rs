//! Source rows and the hash that drives unchanged-row detection.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{source_key, IdValue};

/// One source record moving through the pipeline.
///
/// A row carries two field sets: the source fields as fetched (frozen
/// after construction, in the provider's declared order) and the
/// destination fields the transformer builds up. The row hash covers
/// only the source fields, so derived properties cannot defeat
/// unchanged-row detection between runs.
#[derive(Debug, Clone)]
pub struct Row {
    ids: Vec<IdValue>,
    source: Vec<(String, Value)>,
    destination: Vec<(String, Value)>,
}

impl Row {
    /// Construct a row from its identity tuple and source fields.
    pub fn new(ids: Vec<IdValue>, source: Vec<(String, Value)>) -> Self {
        Self {
            ids,
            source,
            destination: Vec::new(),
        }
    }

    /// The identity tuple, unique within one migration's source set.
    pub fn ids(&self) -> &[IdValue] {
        &self.ids
    }

    /// Stable string form of the identity tuple (the ID map key).
    pub fn source_key(&self) -> String {
        source_key(&self.ids)
    }

    /// Look up a source field by name.
    pub fn source_value(&self, field: &str) -> Option<&Value> {
        self.source
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, v)| v)
    }

    /// Source fields in declared order.
    pub fn source_fields(&self) -> &[(String, Value)] {
        &self.source
    }

    /// Set a destination field, replacing any earlier value.
    pub fn set_destination(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        if let Some(slot) = self.destination.iter_mut().find(|(name, _)| *name == field) {
            slot.1 = value;
        } else {
            self.destination.push((field, value));
        }
    }

    /// Look up a destination field by name.
    pub fn destination_value(&self, field: &str) -> Option<&Value> {
        self.destination
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, v)| v)
    }

    /// Destination fields in the order the transformer produced them.
    pub fn destination_fields(&self) -> &[(String, Value)] {
        &self.destination
    }

    /// SHA-256 over the canonical JSON of the source fields, hex encoded.
    ///
    /// Field order is the declared source order, which the provider
    /// contract keeps stable between runs.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.source {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            // Value serialization is infallible for JSON values.
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}
