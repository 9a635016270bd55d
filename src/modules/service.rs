// Service module - manage systemd services

use crate::executor::context::shell_quote;
use crate::parser::ast::ServiceAction;

pub fn service_command(action: ServiceAction, name: &str) -> String {
    format!("systemctl {} {}", action.as_str(), shell_quote(name))
}
