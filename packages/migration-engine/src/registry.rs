//! Migration definitions, template fan-out, and dependency ordering.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RegistryError, SourceError};
use crate::source::SourceRowProvider;
use crate::transform::FieldMapping;
use crate::types::{IdValueKind, MigrationId};

/// Declaration of one ID field on the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdField {
    pub name: String,
    pub kind: IdValueKind,
}

impl IdField {
    pub fn int(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IdValueKind::Int,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IdValueKind::Text,
        }
    }
}

/// Shape of the source query: which table, which columns, in what
/// order, and optional equality constraints (the mechanism template
/// fan-out uses to split one table into per-variant migrations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub table: String,
    pub columns: Vec<String>,
    /// Columns to order by. Required to be a stable total order so
    /// cursors survive across runs; providers append the ID fields
    /// when this is empty.
    #[serde(default)]
    pub order_by: Vec<String>,
    /// Equality constraints ANDed into the query.
    #[serde(default)]
    pub constraints: BTreeMap<String, Value>,
}

impl SourceSpec {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            order_by: Vec::new(),
            constraints: BTreeMap::new(),
        }
    }
}

/// Destination target plus the declarative field mappings applied by
/// the transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationSpec {
    pub target: String,
    pub mappings: Vec<FieldMapping>,
}

/// One concrete ETL unit: source, destination, mapping, dependencies.
///
/// Read-only during execution. Identifiers are unique within the
/// registry and dependency references must resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDefinition {
    pub id: MigrationId,
    /// Source-system tags this definition applies to (e.g. "d6", "d7").
    #[serde(default)]
    pub source_tags: Vec<String>,
    pub source: SourceSpec,
    pub ids: Vec<IdField>,
    pub destination: DestinationSpec,
    #[serde(default)]
    pub dependencies: Vec<MigrationId>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// One variant produced by template fan-out: a suffix appended to the
/// base id and extra source constraints narrowing the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVariant {
    pub suffix: String,
    #[serde(default)]
    pub constraints: BTreeMap<String, Value>,
}

/// Dynamic fan-out axis: at registry-load time, one variant is
/// discovered per distinct value of `column` in the template's source
/// table (e.g. one migration per content sub-type actually present).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOut {
    pub column: String,
}

/// A definition template that may expand into several concrete
/// migrations: one per statically declared variant plus one per
/// variant discovered through the fan-out axis. A template with
/// neither expands to itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTemplate {
    #[serde(flatten)]
    pub base: MigrationDefinition,
    #[serde(default)]
    pub variants: Vec<TemplateVariant>,
    #[serde(default)]
    pub fan_out: Option<FanOut>,
}

impl MigrationTemplate {
    pub fn from_definition(base: MigrationDefinition) -> Self {
        Self {
            base,
            variants: Vec::new(),
            fan_out: None,
        }
    }

    /// Produce the concrete definitions for the declared variants.
    /// Templates carrying a fan-out axis go through [`resolve`]
    /// instead, which discovers the variant list first.
    ///
    /// [`resolve`]: MigrationTemplate::resolve
    pub fn expand(&self) -> Vec<MigrationDefinition> {
        if self.variants.is_empty() {
            return vec![self.base.clone()];
        }
        self.variants
            .iter()
            .map(|variant| {
                let mut def = self.base.clone();
                def.id = MigrationId::new(format!("{}:{}", self.base.id, variant.suffix));
                def.source
                    .constraints
                    .extend(variant.constraints.clone());
                def
            })
            .collect()
    }

    /// Resolve the template against the source, then expand.
    ///
    /// The fan-out axis is dynamic: the variant list comes from the
    /// distinct values of the fan-out column as found in the source
    /// right now, appended to any statically declared variants.
    pub async fn resolve(
        &self,
        source: &dyn SourceRowProvider,
    ) -> Result<Vec<MigrationDefinition>, SourceError> {
        let Some(fan_out) = &self.fan_out else {
            return Ok(self.expand());
        };
        let values = source
            .distinct_values(&self.base.source.table, &fan_out.column)
            .await?;
        let mut variants = self.variants.clone();
        for value in values {
            let suffix = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            variants.push(TemplateVariant {
                suffix,
                constraints: BTreeMap::from([(fan_out.column.clone(), value)]),
            });
        }
        let resolved = Self {
            base: self.base.clone(),
            variants,
            fan_out: None,
        };
        Ok(resolved.expand())
    }
}

/// Catalog of concrete migration definitions.
///
/// Loaded once before a run; templates are expanded at registration
/// time so execution only ever sees concrete definitions.
#[derive(Debug, Default)]
pub struct MigrationRegistry {
    definitions: Vec<MigrationDefinition>,
    index: HashMap<MigrationId, usize>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one concrete definition.
    pub fn register(&mut self, def: MigrationDefinition) -> Result<(), RegistryError> {
        if self.index.contains_key(&def.id) {
            return Err(RegistryError::DuplicateId { id: def.id });
        }
        self.index.insert(def.id.clone(), self.definitions.len());
        self.definitions.push(def);
        Ok(())
    }

    /// Expand a template and register every concrete definition it
    /// produces.
    pub fn register_template(&mut self, template: &MigrationTemplate) -> Result<(), RegistryError> {
        for def in template.expand() {
            self.register(def)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &MigrationId) -> Option<&MigrationDefinition> {
        self.index.get(id).map(|&i| &self.definitions[i])
    }

    pub fn all_ids(&self) -> Vec<MigrationId> {
        self.definitions.iter().map(|d| d.id.clone()).collect()
    }

    /// Definitions tagged with the given source-system tag, in
    /// registration order.
    pub fn find_by_tag(&self, tag: &str) -> Vec<&MigrationDefinition> {
        self.definitions
            .iter()
            .filter(|d| d.source_tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Validate that every dependency resolves to a registered
    /// definition.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for def in &self.definitions {
            for dep in &def.dependencies {
                if !self.index.contains_key(dep) {
                    return Err(RegistryError::UnknownDependency {
                        id: def.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Dependency-order the requested migrations plus their transitive
    /// dependencies.
    ///
    /// Kahn's algorithm with registration order as the tie-break among
    /// ready nodes, so the result is deterministic. A cycle is a fatal
    /// configuration error reported before anything executes.
    pub fn dependency_order(
        &self,
        requested: &[MigrationId],
    ) -> Result<Vec<MigrationDefinition>, RegistryError> {
        self.validate()?;

        // Closure over transitive dependencies.
        let mut selected: HashSet<MigrationId> = HashSet::new();
        let mut stack: Vec<MigrationId> = Vec::new();
        for id in requested {
            let def = self
                .get(id)
                .ok_or_else(|| RegistryError::UnknownId { id: id.clone() })?;
            if selected.insert(def.id.clone()) {
                stack.push(def.id.clone());
            }
        }
        while let Some(id) = stack.pop() {
            // Dependencies were validated above; get() cannot miss here.
            if let Some(def) = self.get(&id) {
                for dep in &def.dependencies {
                    if selected.insert(dep.clone()) {
                        stack.push(dep.clone());
                    }
                }
            }
        }

        let mut in_degree: HashMap<MigrationId, usize> = HashMap::new();
        for def in &self.definitions {
            if !selected.contains(&def.id) {
                continue;
            }
            in_degree.entry(def.id.clone()).or_insert(0);
            for dep in &def.dependencies {
                if selected.contains(dep) {
                    *in_degree.entry(def.id.clone()).or_insert(0) += 1;
                }
            }
        }

        let mut ordered = Vec::with_capacity(selected.len());
        loop {
            // First registered definition with no unresolved deps.
            let next = self
                .definitions
                .iter()
                .find(|d| in_degree.get(&d.id).is_some_and(|&deg| deg == 0));
            let Some(def) = next else { break };
            let id = def.id.clone();
            in_degree.remove(&id);
            for other in &self.definitions {
                if other.dependencies.contains(&id) {
                    if let Some(deg) = in_degree.get_mut(&other.id) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
            ordered.push(def.clone());
        }

        if !in_degree.is_empty() {
            let mut members: Vec<MigrationId> = in_degree.into_keys().collect();
            members.sort();
            return Err(RegistryError::DependencyCycle { members });
        }
        Ok(ordered)
    }
}
