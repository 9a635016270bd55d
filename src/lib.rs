// pf - symbol-free task runner
//
// Runs tasks from .pf files on the local machine or across SSH hosts in
// parallel, with every output line prefixed by the host it came from.

pub mod config;
pub mod executor;
pub mod inventory;
pub mod modules;
pub mod output;
pub mod parser;
pub mod runtime;

pub use config::PfConfig;
pub use executor::{ExecutionContext, Invocation, Scheduler, SchedulerConfig};
pub use inventory::{HostResolver, HostSelector, Target};
pub use output::{OutputMultiplexer, PfError, RunReport, TerminalOutput};
pub use parser::{load_catalog, parse_document, Catalog};

/// Version of the pf tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::PfConfig;
    pub use crate::executor::{DefaultConnector, Invocation, Scheduler, SchedulerConfig};
    pub use crate::inventory::{EnvAliases, HostDefaults, HostResolver, HostSelector, Target};
    pub use crate::output::{OutputMultiplexer, PfError, RunReport, TerminalOutput};
    pub use crate::parser::{load_catalog, parse_document, Catalog, TaskDefinition};
}
