//! Model selection: which language models answer and how their outputs combine.
//!
//! Pure values, no I/O. The combination itself happens server-side; this
//! module only validates and normalizes what the user picked.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Opaque reference to a model, e.g. `gpt-4o` or `claude-sonnet`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelRef(String);

impl ModelRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    #[default]
    Single,
    Consensus,
    Debate,
}

impl CombineMode {
    /// Modes that combine several models need at least two of them.
    pub fn min_models(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Consensus | Self::Debate => 2,
        }
    }
}

impl fmt::Display for CombineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Consensus => write!(f, "consensus"),
            Self::Debate => write!(f, "debate"),
        }
    }
}

impl FromStr for CombineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "consensus" => Ok(Self::Consensus),
            "debate" => Ok(Self::Debate),
            _ => Err(format!("unknown combine mode: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub enabled_models: BTreeSet<ModelRef>,
    pub combine_mode: CombineMode,
    #[serde(default)]
    pub reveal_intermediate: bool,
}

impl ModelSelection {
    pub fn new(models: impl IntoIterator<Item = ModelRef>, combine_mode: CombineMode) -> Self {
        Self {
            enabled_models: models.into_iter().collect(),
            combine_mode,
            reveal_intermediate: false,
        }
    }

    pub fn single(model: impl Into<ModelRef>) -> Self {
        Self::new([model.into()], CombineMode::Single)
    }

    pub fn with_reveal_intermediate(mut self, reveal: bool) -> Self {
        self.reveal_intermediate = reveal;
        self
    }

    /// Downgrade a multi-model mode to `single` when too few models are enabled.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        if self.enabled_models.len() < self.combine_mode.min_models() {
            out.combine_mode = CombineMode::Single;
        }
        out
    }

    /// Check the selection against the catalog and return the normalized form
    /// that is safe to put on the wire.
    pub fn validate(&self, catalog: &ModelCatalog) -> Result<Self, SessionError> {
        if self.enabled_models.is_empty() {
            return Err(SessionError::NoModelsSelected);
        }
        if !catalog.is_empty() {
            if let Some(unknown) = self.enabled_models.iter().find(|m| !catalog.contains(m)) {
                return Err(SessionError::UnknownModel(unknown.clone()));
            }
        }
        Ok(self.normalized())
    }
}

/// Catalog entry for a model the server can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: ModelRef,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl ModelInfo {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// The set of valid `ModelRef`s. An empty catalog accepts any model, which is
/// what a client sees before the catalog has been fetched.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: BTreeMap<ModelRef, ModelInfo>,
}

impl ModelCatalog {
    pub fn new(models: impl IntoIterator<Item = ModelInfo>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ids.into_iter().map(|id| ModelInfo {
            id: ModelRef::new(id),
            display_name: None,
            provider: None,
        }))
    }

    pub fn contains(&self, model: &ModelRef) -> bool {
        self.models.contains_key(model)
    }

    pub fn get(&self, model: &ModelRef) -> Option<&ModelInfo> {
        self.models.get(model)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ModelCatalog {
        ModelCatalog::from_ids(["gpt-4o", "claude-sonnet", "gemini-pro"])
    }

    #[test]
    fn consensus_with_one_model_downgrades() {
        let sel = ModelSelection::new([ModelRef::from("gpt-4o")], CombineMode::Consensus);
        let validated = sel.validate(&catalog()).unwrap();
        assert_eq!(validated.combine_mode, CombineMode::Single);
        assert_eq!(validated.enabled_models.len(), 1);
    }

    #[test]
    fn debate_with_two_models_is_kept() {
        let sel = ModelSelection::new(
            [ModelRef::from("gpt-4o"), ModelRef::from("claude-sonnet")],
            CombineMode::Debate,
        );
        assert_eq!(
            sel.validate(&catalog()).unwrap().combine_mode,
            CombineMode::Debate
        );
    }

    #[test]
    fn empty_selection_rejected() {
        let sel = ModelSelection::default();
        assert!(matches!(
            sel.validate(&catalog()),
            Err(SessionError::NoModelsSelected)
        ));
    }

    #[test]
    fn unknown_model_rejected() {
        let sel = ModelSelection::single("llama-9000");
        match sel.validate(&catalog()) {
            Err(SessionError::UnknownModel(m)) => assert_eq!(m.as_str(), "llama-9000"),
            other => panic!("expected UnknownModel, got {other:?}"),
        }
    }

    #[test]
    fn empty_catalog_accepts_anything() {
        let sel = ModelSelection::single("whatever");
        assert!(sel.validate(&ModelCatalog::default()).is_ok());
    }

    #[test]
    fn normalized_does_not_touch_reveal_flag() {
        let sel = ModelSelection::new([ModelRef::from("gpt-4o")], CombineMode::Debate)
            .with_reveal_intermediate(true);
        let n = sel.normalized();
        assert!(n.reveal_intermediate);
        assert_eq!(n.combine_mode, CombineMode::Single);
    }

    #[test]
    fn combine_mode_parse_and_display() {
        for mode in [CombineMode::Single, CombineMode::Consensus, CombineMode::Debate] {
            assert_eq!(mode.to_string().parse::<CombineMode>().unwrap(), mode);
        }
        assert!("vote".parse::<CombineMode>().is_err());
    }

    #[test]
    fn selection_wire_shape() {
        let sel = ModelSelection::new(
            [ModelRef::from("a"), ModelRef::from("b")],
            CombineMode::Consensus,
        );
        let json = serde_json::to_value(&sel).unwrap();
        assert_eq!(json["combine_mode"], "consensus");
        assert_eq!(json["enabled_models"], serde_json::json!(["a", "b"]));
        assert_eq!(json["reveal_intermediate"], false);
    }

    #[test]
    fn model_info_display_name_falls_back_to_id() {
        let info = ModelInfo {
            id: ModelRef::from("gpt-4o"),
            display_name: None,
            provider: Some("openai".to_string()),
        };
        assert_eq!(info.display_name(), "gpt-4o");
    }
}
