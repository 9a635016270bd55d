// Variable resolution: layered scopes and $VAR interpolation

mod scope;

pub use scope::{interpolate, resolve_task, ResolvedStep, ResolvedTask, Scope};
