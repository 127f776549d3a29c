//! Step and pipeline definitions, and the registries that resolve them.
//!
//! A step definition is either written inline or referenced by name. String
//! references name a persisted pipeline as `name` or `name:version`; an
//! unversioned reference resolves to the latest registered version.
//!
//! Pipeline definitions declare their children as an index-keyed map:
//!
//! ```json
//! {
//!   "stepType": "pipeline",
//!   "description": "ingest then notify",
//!   "steps": {
//!     "0": { "id": "ingest", "definition": { "stepType": "ping" } },
//!     "1": { "id": "notify", "definition": "notify-pipeline:2" }
//!   }
//! }
//! ```
//!
//! Children execute strictly in ascending index order.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The step type reserved for pipeline steps, which the engine sequences
/// itself rather than handing to a runner.
pub const PIPELINE_STEP_TYPE: &str = "pipeline";

/// A step definition: inline, or a `name[:version]` reference to a
/// persisted pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefinitionOrRef {
    /// Reference to a persisted pipeline definition.
    Ref(String),
    /// Inline definition, used as-is.
    Inline(StepDefinition),
}

/// An inline step or pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// The step type, dispatched through the runner factory
    /// (or [`PIPELINE_STEP_TYPE`] for engine-sequenced pipelines).
    #[serde(rename = "stepType")]
    pub step_type: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Step-type-specific parameters.
    #[serde(default)]
    pub params: Value,
    /// Child steps, keyed by execution index. Only meaningful for pipelines.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<u32, ChildSpec>,
}

impl StepDefinition {
    /// Creates an atomic (non-pipeline) definition with no parameters.
    #[must_use]
    pub fn atomic(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            description: None,
            params: Value::Null,
            steps: BTreeMap::new(),
        }
    }

    /// Creates a pipeline definition from child specs in declared order.
    #[must_use]
    pub fn pipeline(children: impl IntoIterator<Item = ChildSpec>) -> Self {
        Self {
            step_type: PIPELINE_STEP_TYPE.into(),
            description: None,
            params: Value::Null,
            steps: children
                .into_iter()
                .enumerate()
                .map(|(index, child)| (u32::try_from(index).unwrap_or(u32::MAX), child))
                .collect(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the step-type parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Returns true for pipeline definitions.
    #[must_use]
    pub fn is_pipeline(&self) -> bool {
        self.step_type == PIPELINE_STEP_TYPE
    }

    /// Returns the children in execution order (ascending index).
    #[must_use]
    pub fn sorted_children(&self) -> Vec<&ChildSpec> {
        self.steps.values().collect()
    }
}

/// One child entry of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Display identifier within the pipeline.
    pub id: String,
    /// The child's definition, inline or by reference.
    pub definition: DefinitionOrRef,
}

impl ChildSpec {
    /// Creates a child spec.
    #[must_use]
    pub fn new(id: impl Into<String>, definition: DefinitionOrRef) -> Self {
        Self {
            id: id.into(),
            definition,
        }
    }
}

/// Parses a `name[:version]` pipeline reference.
///
/// # Errors
///
/// Returns [`Error::UnknownPipeline`] when the reference is empty or the
/// version suffix is not a number (a malformed reference can never resolve).
pub fn parse_reference(reference: &str) -> Result<(&str, Option<u32>)> {
    let unknown = || Error::UnknownPipeline {
        reference: reference.to_string(),
    };

    match reference.split_once(':') {
        None => {
            if reference.is_empty() {
                return Err(unknown());
            }
            Ok((reference, None))
        }
        Some((name, version)) => {
            if name.is_empty() {
                return Err(unknown());
            }
            let version = version.parse::<u32>().map_err(|_| unknown())?;
            Ok((name, Some(version)))
        }
    }
}

/// Name- and version-indexed store of persisted pipeline definitions.
#[derive(Debug, Default)]
pub struct PipelineLibrary {
    pipelines: HashMap<String, BTreeMap<u32, StepDefinition>>,
}

impl PipelineLibrary {
    /// Creates an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pipeline definition under a name and version.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is not pipeline-typed or the
    /// name/version pair is already registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        version: u32,
        definition: StepDefinition,
    ) -> Result<()> {
        let name = name.into();
        if !definition.is_pipeline() {
            return Err(Error::internal(format!(
                "definition registered as pipeline '{name}' has step type '{}'",
                definition.step_type
            )));
        }

        let versions = self.pipelines.entry(name.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(Error::DuplicatePipeline { name, version });
        }
        versions.insert(version, definition);
        Ok(())
    }

    /// Resolves a `name[:version]` reference to exactly one definition.
    ///
    /// An unversioned reference resolves to the latest registered version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPipeline`] when nothing matches.
    pub fn resolve(&self, reference: &str) -> Result<&StepDefinition> {
        let (name, version) = parse_reference(reference)?;
        let unknown = || Error::UnknownPipeline {
            reference: reference.to_string(),
        };

        let versions = self.pipelines.get(name).ok_or_else(unknown)?;
        match version {
            Some(version) => versions.get(&version).ok_or_else(unknown),
            None => versions.values().next_back().ok_or_else(unknown),
        }
    }
}

/// Registry mapping transaction type names to their root step definitions.
#[derive(Debug, Default)]
pub struct TransactionTypes {
    types: HashMap<String, DefinitionOrRef>,
}

impl TransactionTypes {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transaction type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTransactionType`] if the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        root: DefinitionOrRef,
    ) -> Result<()> {
        let name = name.into();
        if self.types.contains_key(&name) {
            return Err(Error::DuplicateTransactionType { name });
        }
        self.types.insert(name, root);
        Ok(())
    }

    /// Resolves a transaction type to its root definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTransactionType`] when the name is absent.
    pub fn resolve(&self, name: &str) -> Result<&DefinitionOrRef> {
        self.types
            .get(name)
            .ok_or_else(|| Error::UnknownTransactionType {
                name: name.to_string(),
            })
    }
}
