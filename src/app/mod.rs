//! Application / Execution-Context model: AWMs, constraints, recipes, and
//! the per-EXC state machine.

pub mod awm;
pub mod constraint;
pub mod exc;
pub mod recipe;

pub use awm::WorkingMode;
pub use constraint::{BoundType, ConstraintMap};
pub use exc::{Exc, ExcState, ScheduleTuple, SyncSubState};
pub use recipe::{Recipe, RecipeError, RecipeLoader, YamlRecipeLoader};
