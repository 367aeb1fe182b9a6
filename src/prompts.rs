use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::level::LevelCode;

/// Prompt templates the decision pipeline uses at a given level.
/// The escalation logic never reads these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptBinding {
    pub level: Option<LevelCode>,
    #[serde(default)]
    pub decision_prompt_id: Option<String>,
    #[serde(default)]
    pub debate_prompt_id: Option<String>,
    #[serde(default)]
    pub intelligence_prompt_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptBindings {
    by_level: HashMap<LevelCode, PromptBinding>,
    fallback: Option<PromptBinding>,
}

impl PromptBindings {
    /// A binding without `level` becomes the fallback for unbound levels.
    pub fn new(bindings: Vec<PromptBinding>) -> Self {
        let mut out = Self::default();
        for b in bindings {
            match b.level {
                Some(code) => {
                    out.by_level.insert(code, b);
                }
                None => out.fallback = Some(b),
            }
        }
        out
    }

    pub fn for_level(&self, code: LevelCode) -> Option<&PromptBinding> {
        self.by_level.get(&code).or(self.fallback.as_ref())
    }
}
