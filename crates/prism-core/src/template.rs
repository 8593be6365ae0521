//! Template engine — single-pass `{{Name}}` placeholder expansion.
//!
//! Recognized placeholder names are fixed by the catalog contract:
//! `{{N}}`, `{{PrevStepOutput}}`, `{{YesAnswers}}`, `{{NoAnswers}}`,
//! `{{InputText}}`. Ray texts are never substituted through a placeholder;
//! they travel in the conversation context instead.
//!
//! Expansion is a single literal pass: substituted values are never
//! re-scanned, so untrusted model output cannot inject further
//! placeholders. A placeholder absent from the context fails the whole
//! expansion — partial substitution is not a valid state.

use std::collections::HashMap;

use regex::Regex;

/// `{{N}}` — the number of ray replies presented to the model.
pub const PLACEHOLDER_RAY_COUNT: &str = "N";
/// `{{PrevStepOutput}}` — the immediately preceding step's materialized output.
pub const PLACEHOLDER_PREV_STEP: &str = "PrevStepOutput";
/// `{{YesAnswers}}` — checklist items the user selected.
pub const PLACEHOLDER_YES_ANSWERS: &str = "YesAnswers";
/// `{{NoAnswers}}` — checklist items the user left unselected.
pub const PLACEHOLDER_NO_ANSWERS: &str = "NoAnswers";
/// `{{InputText}}` — raw free text supplied by the user.
pub const PLACEHOLDER_INPUT_TEXT: &str = "InputText";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// The template references a name the context does not provide.
    /// This is a catalog-authoring defect, not a runtime condition to
    /// recover from.
    #[error("unresolved placeholder {{{{{0}}}}}")]
    UnresolvedPlaceholder(String),
}

/// Mapping from placeholder names to their current values.
///
/// Rebuilt/extended after every pipeline step; never rolled back. Unknown
/// extra keys are ignored by [`expand`].
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or overwrite) a placeholder value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Builder-style variant of [`TemplateContext::set`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

fn placeholder_regex() -> Regex {
    Regex::new(r"\{\{([A-Za-z][A-Za-z0-9_]*)\}\}").unwrap()
}

/// Expand every `{{Name}}` occurrence in `template` from `context`.
///
/// All occurrences of the same name are replaced identically. Fails with
/// [`TemplateError::UnresolvedPlaceholder`] before substituting anything if
/// any referenced name is missing.
pub fn expand(template: &str, context: &TemplateContext) -> Result<String, TemplateError> {
    let re = placeholder_regex();

    // Validate up front so a missing name never yields partial output.
    for caps in re.captures_iter(template) {
        let name = &caps[1];
        if !context.contains(name) {
            return Err(TemplateError::UnresolvedPlaceholder(name.to_string()));
        }
    }

    let expanded = re.replace_all(template, |caps: &regex::Captures| {
        context.get(&caps[1]).unwrap_or_default().to_string()
    });
    Ok(expanded.into_owned())
}
