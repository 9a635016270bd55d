// Parser module for .pf task files

pub mod ast;
pub mod builtins;
pub mod dsl;
pub mod include;

pub use ast::*;
pub use builtins::{builtin_tasks, embedded_catalog};
pub use dsl::parse_document;
pub use include::{load_catalog, IncludeResolver};
