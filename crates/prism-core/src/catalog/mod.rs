//! Fusion instruction catalog — immutable registry of fusion factories.
//!
//! A factory is a named recipe: an ordered list of [`Instruction`]s that the
//! gather pipeline walks step by step. The catalog is pure configuration:
//! it is consulted at run start and never mutated by a run. `instantiate`
//! always builds a **fresh** instruction list so per-run bookkeeping can
//! never leak between runs that use the same factory.

pub mod factories;

use serde::{Deserialize, Serialize};

use crate::error::PrismError;

pub type FactoryId = String;

/// Reserved id for the user-authored factory (single gather step with
/// user-supplied prompts).
pub const CUSTOM_FACTORY_ID: &str = "custom";

/// Factory selected when the caller does not specify one.
pub const DEFAULT_FACTORY_ID: &str = "fuse";

/// Which kind of human input a suspended step is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserInputKind {
    Checklist,
    FreeText,
}

/// Presentation hint for a step's output. Opaque to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayHint {
    ChatMessage,
}

/// One step of a fusion recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Instruction {
    /// Automated synthesis step: expand both prompt templates, call the
    /// model with the ray replies in context, fold the answer forward.
    #[serde(rename_all = "camelCase")]
    Gather {
        label: String,
        /// Opaque context-selection tag passed through to the invoker.
        method: String,
        system_prompt: String,
        user_prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display: Option<DisplayHint>,
    },

    /// Suspend until the user picks yes/no over checklist items extracted
    /// from the previous step's output.
    #[serde(rename = "user-input-checklist", rename_all = "camelCase")]
    Checklist {
        label: String,
        /// Template referencing `{{YesAnswers}}` / `{{NoAnswers}}`.
        output_prompt: String,
    },

    /// Suspend until the user supplies free text.
    #[serde(rename = "user-input-text", rename_all = "camelCase")]
    FreeText {
        label: String,
        /// Template referencing `{{InputText}}`.
        output_prompt: String,
    },
}

impl Instruction {
    pub fn label(&self) -> &str {
        match self {
            Instruction::Gather { label, .. }
            | Instruction::Checklist { label, .. }
            | Instruction::FreeText { label, .. } => label,
        }
    }

    /// The input kind this step suspends on, if any.
    pub fn user_input_kind(&self) -> Option<UserInputKind> {
        match self {
            Instruction::Gather { .. } => None,
            Instruction::Checklist { .. } => Some(UserInputKind::Checklist),
            Instruction::FreeText { .. } => Some(UserInputKind::FreeText),
        }
    }
}

// ─── Factory ───────────────────────────────────────────────────────────────

/// How a factory produces its instruction list.
#[derive(Debug, Clone)]
enum Blueprint {
    /// Built-in: a pure constructor function returning a fresh list.
    Builtin(fn() -> Vec<Instruction>),
    /// User-defined (YAML or custom prompts): canonical data, deep-cloned
    /// on every instantiation.
    Data(Vec<Instruction>),
}

/// A named fusion recipe with its display metadata.
#[derive(Debug, Clone)]
pub struct FusionFactory {
    pub factory_id: FactoryId,
    pub short_label: String,
    pub add_label: String,
    pub card_title: String,
    pub description: String,
    blueprint: Blueprint,
}

impl FusionFactory {
    /// Build a data-backed factory (used for YAML files and custom prompts).
    pub fn from_instructions(
        factory_id: impl Into<FactoryId>,
        short_label: impl Into<String>,
        description: impl Into<String>,
        instructions: Vec<Instruction>,
    ) -> Self {
        let short_label = short_label.into();
        Self {
            factory_id: factory_id.into(),
            add_label: format!("Add {}", short_label),
            card_title: short_label.clone(),
            short_label,
            description: description.into(),
            blueprint: Blueprint::Data(instructions),
        }
    }

    pub(crate) fn builtin(
        factory_id: &str,
        short_label: &str,
        add_label: &str,
        card_title: &str,
        description: &str,
        constructor: fn() -> Vec<Instruction>,
    ) -> Self {
        Self {
            factory_id: factory_id.to_string(),
            short_label: short_label.to_string(),
            add_label: add_label.to_string(),
            card_title: card_title.to_string(),
            description: description.to_string(),
            blueprint: Blueprint::Builtin(constructor),
        }
    }

    /// Produce a fresh instruction list. The result never shares mutable
    /// sub-structures with the catalog or with any earlier instantiation.
    pub fn instantiate(&self) -> Vec<Instruction> {
        match &self.blueprint {
            Blueprint::Builtin(constructor) => constructor(),
            Blueprint::Data(instructions) => instructions.clone(),
        }
    }

    pub fn summary(&self) -> FactorySummary {
        FactorySummary {
            factory_id: self.factory_id.clone(),
            short_label: self.short_label.clone(),
            add_label: self.add_label.clone(),
            card_title: self.card_title.clone(),
            description: self.description.clone(),
            steps: self.instantiate().len(),
        }
    }
}

/// Serializable factory metadata for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorySummary {
    pub factory_id: FactoryId,
    pub short_label: String,
    pub add_label: String,
    pub card_title: String,
    pub description: String,
    pub steps: usize,
}

// ─── User-authored factory files ───────────────────────────────────────────

/// A user-defined factory loaded from YAML:
///
/// ```yaml
/// factoryId: "style-merge"
/// shortLabel: "Style Merge"
/// description: "Merge replies following a user-described style."
/// instructions:
///   - type: user-input-text
///     label: "Describe the style"
///     outputPrompt: "Rewrite following: {{InputText}}"
///   - type: gather
///     label: "Merging"
///     method: "s-s0-h0-u0-aN-u"
///     systemPrompt: "You merge {{N}} replies."
///     userPrompt: "{{PrevStepOutput}}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryFile {
    pub factory_id: FactoryId,
    pub short_label: String,
    #[serde(default)]
    pub add_label: Option<String>,
    #[serde(default)]
    pub card_title: Option<String>,
    #[serde(default)]
    pub description: String,
    pub instructions: Vec<Instruction>,
}

impl FactoryFile {
    pub fn from_yaml(yaml: &str) -> Result<Self, PrismError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PrismError::FactoryFile(format!("failed to parse factory YAML: {}", e)))
    }

    /// Load from disk, resolving `${ENV_VAR}` references in the file body
    /// so factories can pull prompt fragments from the environment.
    pub fn from_file(path: &str) -> Result<Self, PrismError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PrismError::FactoryFile(format!("failed to read factory file '{}': {}", path, e))
        })?;
        Self::from_yaml(&crate::invoke::resolve_env_vars(&content))
    }

    pub fn into_factory(self) -> Result<FusionFactory, PrismError> {
        if self.instructions.is_empty() {
            return Err(PrismError::FactoryFile(format!(
                "factory '{}' has no instructions",
                self.factory_id
            )));
        }
        let mut factory = FusionFactory::from_instructions(
            self.factory_id,
            self.short_label,
            self.description,
            self.instructions,
        );
        if let Some(add_label) = self.add_label {
            factory.add_label = add_label;
        }
        if let Some(card_title) = self.card_title {
            factory.card_title = card_title;
        }
        Ok(factory)
    }
}

// ─── Catalog ───────────────────────────────────────────────────────────────

/// Ordered, id-unique registry of fusion factories.
#[derive(Debug, Clone)]
pub struct FusionCatalog {
    factory_list: Vec<FusionFactory>,
}

impl FusionCatalog {
    /// Catalog with only the built-in factories.
    pub fn builtin() -> Self {
        Self {
            factory_list: factories::builtin_factories(),
        }
    }

    pub fn list(&self) -> Vec<FactorySummary> {
        self.factory_list.iter().map(FusionFactory::summary).collect()
    }

    pub fn get(&self, factory_id: &str) -> Option<&FusionFactory> {
        self.factory_list.iter().find(|f| f.factory_id == factory_id)
    }

    /// Fresh instruction list for `factory_id`.
    pub fn instantiate(&self, factory_id: &str) -> Result<Vec<Instruction>, PrismError> {
        self.get(factory_id)
            .map(FusionFactory::instantiate)
            .ok_or_else(|| PrismError::UnknownFactory(factory_id.to_string()))
    }

    /// Register an additional factory. Ids must stay unique.
    pub fn register(&mut self, factory: FusionFactory) -> Result<(), PrismError> {
        if self.get(&factory.factory_id).is_some() {
            return Err(PrismError::DuplicateFactory(factory.factory_id));
        }
        self.factory_list.push(factory);
        Ok(())
    }

    /// Replace the reserved `custom` factory's prompts with user-supplied
    /// ones. The custom factory is always a single gather step.
    pub fn set_custom(&mut self, system_prompt: impl Into<String>, user_prompt: impl Into<String>) {
        let factory = factories::custom_with_prompts(system_prompt.into(), user_prompt.into());
        match self
            .factory_list
            .iter_mut()
            .find(|f| f.factory_id == CUSTOM_FACTORY_ID)
        {
            Some(slot) => *slot = factory,
            None => self.factory_list.push(factory),
        }
    }
}

impl Default for FusionCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_has_default_and_custom() {
        let catalog = FusionCatalog::builtin();
        assert!(catalog.get(DEFAULT_FACTORY_ID).is_some());
        assert!(catalog.get(CUSTOM_FACTORY_ID).is_some());
    }

    #[test]
    fn test_unknown_factory() {
        let catalog = FusionCatalog::builtin();
        let err = catalog.instantiate("nope").unwrap_err();
        assert!(matches!(err, PrismError::UnknownFactory(id) if id == "nope"));
    }

    #[test]
    fn test_instantiate_yields_independent_lists() {
        let catalog = FusionCatalog::builtin();
        let mut first = catalog.instantiate("guided").unwrap();
        let second = catalog.instantiate("guided").unwrap();

        // Mutate the first list's bookkeeping; the second must not move.
        if let Instruction::Gather { label, .. } = &mut first[0] {
            label.push_str(" (mutated)");
        }
        first.push(first[0].clone());

        assert_eq!(second.len(), 3);
        assert!(!second[0].label().contains("mutated"));

        // The catalog's canonical copy is also unaffected.
        let third = catalog.instantiate("guided").unwrap();
        assert!(!third[0].label().contains("mutated"));
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let mut catalog = FusionCatalog::builtin();
        let dup = FusionFactory::from_instructions(
            DEFAULT_FACTORY_ID,
            "Dup",
            "duplicate",
            vec![Instruction::FreeText {
                label: "x".into(),
                output_prompt: "{{InputText}}".into(),
            }],
        );
        assert!(matches!(
            catalog.register(dup),
            Err(PrismError::DuplicateFactory(_))
        ));
    }

    #[test]
    fn test_factory_file_round_trip() {
        let yaml = r#"
factoryId: "style-merge"
shortLabel: "Style Merge"
description: "Merge replies following a user-described style."
instructions:
  - type: user-input-text
    label: "Describe the style"
    outputPrompt: "Rewrite following: {{InputText}}"
  - type: gather
    label: "Merging"
    method: "s-s0-h0-u0-aN-u"
    systemPrompt: "You merge {{N}} replies."
    userPrompt: "{{PrevStepOutput}}"
"#;
        let file = FactoryFile::from_yaml(yaml).unwrap();
        assert_eq!(file.factory_id, "style-merge");
        let factory = file.into_factory().unwrap();
        let instructions = factory.instantiate();
        assert_eq!(instructions.len(), 2);
        assert_eq!(
            instructions[0].user_input_kind(),
            Some(UserInputKind::FreeText)
        );
        assert!(instructions[1].user_input_kind().is_none());
    }

    #[test]
    fn test_factory_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("factory.yaml");
        std::fs::write(
            &path,
            "factoryId: disk\nshortLabel: Disk\ninstructions:\n  - type: gather\n    label: Merging\n    method: \"s-s0-h0-u0-aN-u\"\n    systemPrompt: merge\n    userPrompt: \"{{N}}\"\n",
        )
        .unwrap();
        let file = FactoryFile::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(file.factory_id, "disk");

        let err = FactoryFile::from_file("/nonexistent/factory.yaml").unwrap_err();
        assert!(matches!(err, PrismError::FactoryFile(_)));
    }

    #[test]
    fn test_factory_file_resolves_env_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("factory.yaml");
        std::fs::write(
            &path,
            "factoryId: disk\nshortLabel: Disk\ninstructions:\n  - type: gather\n    label: Merging\n    method: \"s-s0-h0-u0-aN-u\"\n    systemPrompt: \"${PRISM_TEST_FACTORY_SYSTEM:-merge carefully}\"\n    userPrompt: \"{{N}}\"\n",
        )
        .unwrap();
        let file = FactoryFile::from_file(path.to_str().unwrap()).unwrap();
        match &file.instructions[0] {
            Instruction::Gather { system_prompt, .. } => {
                assert_eq!(system_prompt, "merge carefully");
            }
            other => panic!("expected gather, got {:?}", other),
        }
    }

    #[test]
    fn test_factory_file_requires_instructions() {
        let file = FactoryFile {
            factory_id: "empty".into(),
            short_label: "Empty".into(),
            add_label: None,
            card_title: None,
            description: String::new(),
            instructions: vec![],
        };
        assert!(matches!(
            file.into_factory(),
            Err(PrismError::FactoryFile(_))
        ));
    }

    #[test]
    fn test_set_custom_replaces_prompts() {
        let mut catalog = FusionCatalog::builtin();
        catalog.set_custom("my system", "my user {{N}}");
        let instructions = catalog.instantiate(CUSTOM_FACTORY_ID).unwrap();
        assert_eq!(instructions.len(), 1);
        match &instructions[0] {
            Instruction::Gather {
                system_prompt,
                user_prompt,
                ..
            } => {
                assert_eq!(system_prompt, "my system");
                assert_eq!(user_prompt, "my user {{N}}");
            }
            other => panic!("expected gather step, got {:?}", other),
        }
    }
}
