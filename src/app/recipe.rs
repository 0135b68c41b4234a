//! Recipe loading: the declarative description of an application's AWMs,
//! constraints, and plugin data.
//!
//! The wire grammar is an external-collaborator contract (spec.md §6): the
//! original parses XML, we define a [`RecipeLoader`] trait boundary plus a
//! first-party implementation reading a small `serde_yaml` document — YAML
//! is the idiomatic Rust stand-in for a declarative on-disk record, the
//! same role `serde_yaml` plays for the teacher's own config records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::app::awm::WorkingMode;
use crate::app::constraint::{BoundType, ConstraintMap};
use crate::resources::ResourceAccounter;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecipeError {
    #[error("recipe file {0} could not be read: {1}")]
    Io(String, String),
    #[error("recipe file {0} is not valid YAML: {1}")]
    Parse(String, String),
    #[error("AWM '{awm}' in recipe {recipe} references unregistered resource path '{path}'")]
    UnregisteredPath { recipe: String, awm: String, path: String },
    #[error("AWM '{awm}' in recipe {recipe} requests {amount} on '{path}' but only {total} total is registered")]
    OverTotal { recipe: String, awm: String, path: String, amount: u64, total: u64 },
}

#[derive(Debug, Deserialize)]
struct RecipeUsageDoc {
    path: String,
    amount: u64,
    #[serde(default)]
    units: String,
}

#[derive(Debug, Deserialize)]
struct RecipeAwmDoc {
    name: String,
    value: u16,
    #[serde(default)]
    usage: Vec<RecipeUsageDoc>,
}

#[derive(Debug, Deserialize)]
struct RecipeConstraintDoc {
    path: String,
    bound: String,
    value: u64,
}

#[derive(Debug, Deserialize, Default)]
struct RecipeDoc {
    #[serde(default)]
    awm: Vec<RecipeAwmDoc>,
    #[serde(default)]
    constraint: Vec<RecipeConstraintDoc>,
    #[serde(default)]
    plugin_data: HashMap<String, String>,
}

/// The fully resolved, loaded form of a recipe — ready to be attached to an
/// execution context.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub name: String,
    pub awms: Vec<WorkingMode>,
    pub constraints: ConstraintMap,
    pub plugin_data: HashMap<String, String>,
    /// Set when one or more AWMs referenced an unregistered path and the
    /// caller tolerated it (weak load). Those AWMs are dropped from `awms`.
    pub weak_load: bool,
}

/// Plugin boundary for recipe parsing (spec.md §1, §6: recipe parsing is an
/// external collaborator). Resolution against the registered resource set
/// happens inside the loader so a recipe can never carry demand the
/// accounter doesn't know about.
pub trait RecipeLoader: Send + Sync {
    fn load(
        &self,
        name: &str,
        accounter: &ResourceAccounter,
        allow_weak: bool,
    ) -> Result<Recipe, RecipeError>;
}

/// First-party `RecipeLoader` reading `{recipe_dir}/{name}.yaml`.
pub struct YamlRecipeLoader {
    pub recipe_dir: PathBuf,
}

impl YamlRecipeLoader {
    pub fn new(recipe_dir: impl Into<PathBuf>) -> Self {
        Self { recipe_dir: recipe_dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.recipe_dir.join(format!("{name}.yaml"))
    }
}

impl RecipeLoader for YamlRecipeLoader {
    fn load(
        &self,
        name: &str,
        accounter: &ResourceAccounter,
        allow_weak: bool,
    ) -> Result<Recipe, RecipeError> {
        let path = self.path_for(name);
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| RecipeError::Io(path.display().to_string(), e.to_string()))?;
        parse_recipe(name, &contents, accounter, allow_weak)
    }
}

/// Parse and resolve a recipe document against `accounter`, independent of
/// where the bytes came from (used directly by tests and by
/// [`YamlRecipeLoader`]).
pub fn parse_recipe(
    name: &str,
    yaml: &str,
    accounter: &ResourceAccounter,
    allow_weak: bool,
) -> Result<Recipe, RecipeError> {
    let doc: RecipeDoc = serde_yaml::from_str(yaml)
        .map_err(|e| RecipeError::Parse(name.to_string(), e.to_string()))?;

    let mut awms = Vec::with_capacity(doc.awm.len());
    let mut weak_load = false;

    for (idx, awm_doc) in doc.awm.into_iter().enumerate() {
        let mut usage_template = Vec::with_capacity(awm_doc.usage.len());
        let mut rejected = false;
        for u in &awm_doc.usage {
            if !accounter.is_registered(&u.path) {
                if allow_weak {
                    weak_load = true;
                    rejected = true;
                    break;
                }
                return Err(RecipeError::UnregisteredPath {
                    recipe: name.to_string(),
                    awm: awm_doc.name.clone(),
                    path: u.path.clone(),
                });
            }
            let total = accounter.total(&u.path);
            if u.amount > total {
                if allow_weak {
                    weak_load = true;
                    rejected = true;
                    break;
                }
                return Err(RecipeError::OverTotal {
                    recipe: name.to_string(),
                    awm: awm_doc.name.clone(),
                    path: u.path.clone(),
                    amount: u.amount,
                    total,
                });
            }
            usage_template.push((u.path.clone(), u.amount));
        }
        if rejected {
            continue;
        }
        awms.push(WorkingMode::new(idx as u32, awm_doc.name, awm_doc.value, usage_template));
    }

    let mut constraints = ConstraintMap::new();
    for c in doc.constraint {
        let bound_type = match c.bound.to_ascii_lowercase().as_str() {
            "lower" => BoundType::Lower,
            "upper" => BoundType::Upper,
            _ => continue,
        };
        constraints.set(&c.path, bound_type, c.value);
    }

    Ok(Recipe {
        name: name.to_string(),
        awms,
        constraints,
        plugin_data: doc.plugin_data,
        weak_load,
    })
}
