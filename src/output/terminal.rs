// Terminal rendering: run header, recap table and task listing

use std::io::IsTerminal;
use std::time::Duration;

use colored::*;

use crate::inventory::{EnvAliases, Target};
use crate::output::errors::StepError;
use crate::parser::ast::Catalog;

/// Terminal output manager
pub struct TerminalOutput {
    verbose: bool,
    quiet: bool,
}

impl TerminalOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        // Respect NO_COLOR environment variable (https://no-color.org/)
        // Also disable colors if not a TTY
        if std::env::var("NO_COLOR").is_ok() || !std::io::stdout().is_terminal() {
            colored::control::set_override(false);
        }

        TerminalOutput { verbose, quiet }
    }

    /// Print a header for a run
    pub fn print_run_header(&self, tasks: &[String], targets: &[Target]) {
        if self.quiet {
            return;
        }

        println!(
            "{} {} ({} {})",
            "RUN".green().bold(),
            tasks.join(", ").cyan(),
            targets.len(),
            if targets.len() == 1 { "target" } else { "targets" }
        );
        if self.verbose {
            for target in targets {
                println!("  {} {}", "-".dimmed(), target);
            }
        }
        println!("{}", "─".repeat(60).dimmed());
    }

    /// Print the per-target recap
    pub fn print_recap(&self, report: &RunReport) {
        println!();
        println!("{}", "RUN RECAP".green().bold());
        println!("{}", "─".repeat(60).dimmed());

        let width = report
            .targets
            .iter()
            .map(|t| t.target.label().len())
            .max()
            .unwrap_or(0)
            .max(20);

        for target in &report.targets {
            let ok = format!("ok={}", target.ok_count()).green();
            let failed = if target.failed_count() > 0 {
                format!("failed={}", target.failed_count()).red().bold()
            } else {
                format!("failed={}", target.failed_count()).normal()
            };

            let status = match &target.status {
                TargetStatus::Succeeded => "succeeded".green(),
                TargetStatus::Failed(err) => format!("failed at {}", err).red(),
                TargetStatus::Cancelled => "cancelled".yellow(),
            };

            println!(
                "{:<width$} : {}    {}    {}",
                target.target.label().white().bold(),
                ok,
                failed,
                status,
                width = width
            );

            if self.verbose {
                for step in &target.steps {
                    println!(
                        "    {:>4} {:<8} {:>7.2}s  {}",
                        step.line,
                        step.exit_code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        step.duration.as_secs_f64(),
                        step.label.dimmed()
                    );
                }
            }
        }

        println!();
        println!("Total time: {:.2}s", report.duration.as_secs_f64());
    }

    /// Print all tasks with descriptions, then the configured environments
    pub fn print_task_list(&self, catalog: &Catalog, aliases: &EnvAliases) {
        let builtins: Vec<&str> = catalog.builtin_tasks().map(|t| t.name.as_str()).collect();
        if !builtins.is_empty() {
            println!("{}", "Built-ins:".bold());
            println!("  {}", builtins.join("  ").cyan());
            println!();
        }

        match catalog.files().first() {
            Some(root) => println!("{} {}:", "Tasks from".bold(), root.display()),
            None => println!("{}", "Tasks from embedded task file:".bold()),
        }

        let tasks: Vec<_> = catalog.user_tasks().collect();
        if tasks.is_empty() {
            println!("  {}", "(none)".dimmed());
        }

        let width = tasks.iter().map(|t| t.name.len()).max().unwrap_or(0);
        for task in tasks {
            match &task.description {
                Some(desc) => println!(
                    "  {:<width$}  {}",
                    task.name.cyan(),
                    desc.dimmed(),
                    width = width
                ),
                None => println!("  {}", task.name.cyan()),
            }
        }

        if !aliases.is_empty() {
            println!();
            println!("{}", "Environments:".bold());
            for (name, value) in aliases.iter() {
                let entries = value.entries();
                let hosts = if entries.is_empty() {
                    "(empty)".to_string()
                } else {
                    entries.join(", ")
                };
                println!("  {}: {}", name.cyan(), hosts);
            }
        }
    }
}

/// Outcome of one step on one target
#[derive(Debug, Clone)]
pub struct StepResult {
    pub task: String,
    pub line: usize,
    pub label: String,
    /// `None` when the step never produced an exit status (transport error,
    /// timeout, cancellation)
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_code.unwrap_or(0) == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Succeeded,
    Failed(StepError),
    Cancelled,
}

/// Everything that happened on one target
#[derive(Debug, Clone)]
pub struct TargetReport {
    pub target: Target,
    pub steps: Vec<StepResult>,
    pub status: TargetStatus,
}

impl TargetReport {
    pub fn succeeded(&self) -> bool {
        self.status == TargetStatus::Succeeded
    }

    pub fn ok_count(&self) -> usize {
        self.steps.iter().filter(|s| s.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps.iter().filter(|s| !s.succeeded()).count()
    }
}

/// Summary of a whole run, one report per target in target order
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub targets: Vec<TargetReport>,
    pub duration: Duration,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.targets.iter().all(TargetReport::succeeded)
    }

    pub fn was_cancelled(&self) -> bool {
        self.targets
            .iter()
            .any(|t| t.status == TargetStatus::Cancelled)
    }

    pub fn failed_targets(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| !t.succeeded())
    }

    pub fn get(&self, target: &Target) -> Option<&TargetReport> {
        self.targets.iter().find(|t| &t.target == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(line: usize, exit_code: Option<i32>, error: Option<&str>) -> StepResult {
        StepResult {
            task: "deploy".to_string(),
            line,
            label: "shell true".to_string(),
            exit_code,
            duration: Duration::from_millis(5),
            error: error.map(String::from),
        }
    }

    #[test]
    fn test_step_success_rules() {
        assert!(step(1, Some(0), None).succeeded());
        assert!(step(1, None, None).succeeded());
        assert!(!step(1, Some(2), None).succeeded());
        assert!(!step(1, None, Some("ssh: refused")).succeeded());
    }

    #[test]
    fn test_run_report_rollup() {
        let ok = TargetReport {
            target: Target::remote("a", "h2", 22),
            steps: vec![step(2, Some(0), None), step(3, Some(0), None)],
            status: TargetStatus::Succeeded,
        };
        let failed = TargetReport {
            target: Target::remote("a", "h1", 22),
            steps: vec![step(2, Some(0), None), step(3, Some(1), None)],
            status: TargetStatus::Failed(StepError {
                target: "a@h1:22".to_string(),
                task: "deploy".to_string(),
                line: 3,
                step: "shell false".to_string(),
                exit_code: Some(1),
                message: "exit code 1".to_string(),
            }),
        };

        let report = RunReport {
            targets: vec![failed, ok],
            duration: Duration::from_secs(1),
        };

        assert!(!report.success());
        assert!(!report.was_cancelled());
        assert_eq!(report.failed_targets().count(), 1);

        let h1 = report.get(&Target::remote("a", "h1", 22)).unwrap();
        assert_eq!(h1.ok_count(), 1);
        assert_eq!(h1.failed_count(), 1);
    }
}
