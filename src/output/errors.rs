// Human-readable error messages for pf

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

/// Initialize color output based on TTY detection and NO_COLOR environment variable
fn should_use_colors() -> bool {
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    // Errors are written to stderr
    std::io::stderr().is_terminal()
}

/// All error types in pf
#[derive(Debug)]
pub enum PfError {
    /// Malformed DSL, attributed to a file and line
    Parse(Box<ParseError>),

    /// An include chain loops back onto a file still being loaded
    Cycle { chain: Vec<PathBuf> },

    /// Two files (or one file twice) define the same task name
    DuplicateTask {
        name: String,
        first: PathBuf,
        first_line: usize,
        second: PathBuf,
        second_line: usize,
    },

    /// An include directive points at a file that cannot be read
    IncludeNotFound {
        path: PathBuf,
        included_from: PathBuf,
        line: usize,
    },

    /// Task name not present in the catalog
    UnknownTask {
        name: String,
        candidates: Vec<String>,
    },

    /// A host entry or env alias could not be turned into a target
    HostResolution {
        entry: String,
        message: String,
        suggestion: Option<String>,
    },

    /// Host selection produced an empty target set
    NoTargets,

    /// Configuration file errors
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// I/O errors
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// SSH connection errors
    Ssh {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// Timeout errors
    Timeout {
        operation: String,
        duration_secs: u64,
    },

    /// The run was interrupted before the operation completed
    Cancelled { operation: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    pub file: Option<PathBuf>,
    pub line: usize,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnknownVerb,
    MalformedStep,
    InvalidModifier,
    NestedTask,
    UnterminatedTask,
    UnexpectedEnd,
    OutsideTask,
}

/// A step that failed on one target, kept in that target's report
///
/// Transport failures are attributed to the target's first step and carry
/// no exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    pub target: String,
    pub task: String,
    pub line: usize,
    pub step: String,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, line: usize, message: impl Into<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            file: None,
            line,
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl From<ParseError> for PfError {
    fn from(err: ParseError) -> Self {
        PfError::Parse(Box::new(err))
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({}): {}", self.task, self.line, self.step, self.message)
    }
}

impl std::error::Error for PfError {}

impl fmt::Display for PfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            PfError::Parse(err) => {
                writeln!(f, "{}: {}", "PARSE ERROR".red().bold(), err.message)?;
                write!(f, "  {} ", "-->".blue())?;
                match err.file {
                    Some(ref file) => writeln!(f, "{}:{}", file.display().to_string().cyan(), err.line)?,
                    None => writeln!(f, "line {}", err.line)?,
                }

                if let Some(ref suggestion) = err.suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            PfError::Cycle { chain } => {
                writeln!(f, "{}: include cycle detected", "INCLUDE ERROR".red().bold())?;
                for (i, path) in chain.iter().enumerate() {
                    let arrow = if i == 0 { "   " } else { "-> " };
                    writeln!(f, "  {}{}", arrow.dimmed(), path.display())?;
                }
                Ok(())
            }

            PfError::DuplicateTask {
                name,
                first,
                first_line,
                second,
                second_line,
            } => {
                writeln!(
                    f,
                    "{}: task '{}' is defined more than once",
                    "CATALOG ERROR".red().bold(),
                    name
                )?;
                writeln!(f, "  {} {}:{}", "First:".dimmed(), first.display(), first_line)?;
                writeln!(f, "  {} {}:{}", "Again:".dimmed(), second.display(), second_line)?;
                writeln!(f)?;
                writeln!(
                    f,
                    "{}: rename one of the tasks; definitions never shadow each other",
                    "Hint".yellow().bold()
                )
            }

            PfError::IncludeNotFound {
                path,
                included_from,
                line,
            } => {
                writeln!(
                    f,
                    "{}: included file not found: {}",
                    "INCLUDE ERROR".red().bold(),
                    path.display()
                )?;
                writeln!(
                    f,
                    "  {} {}:{}",
                    "-->".blue(),
                    included_from.display().to_string().cyan(),
                    line
                )
            }

            PfError::UnknownTask { name, candidates } => {
                writeln!(f, "{}: no such task: {}", "ERROR".red().bold(), name)?;
                if !candidates.is_empty() {
                    writeln!(f)?;
                    writeln!(
                        f,
                        "{}: did you mean: {}?",
                        "Hint".yellow().bold(),
                        candidates.join(", ")
                    )?;
                }
                Ok(())
            }

            PfError::HostResolution {
                entry,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "HOST ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Entry:".dimmed(), entry)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            PfError::NoTargets => {
                writeln!(f, "{}: no target hosts selected", "HOST ERROR".red().bold())?;
                writeln!(f)?;
                writeln!(
                    f,
                    "{}: pass env=<alias>, hosts=<user@host:port,...> or host=@local",
                    "Hint".yellow().bold()
                )
            }

            PfError::Config { message, path } => {
                writeln!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            PfError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            PfError::Ssh {
                host,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "SSH ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            PfError::Timeout {
                operation,
                duration_secs,
            } => {
                writeln!(
                    f,
                    "{}: {} timed out after {}s",
                    "TIMEOUT".red().bold(),
                    operation,
                    duration_secs
                )
            }

            PfError::Cancelled { operation } => {
                writeln!(f, "{}: {}", "CANCELLED".yellow().bold(), operation)
            }
        }
    }
}

/// One-line form used in per-host failure markers and the recap
pub fn short_message(error: &PfError) -> String {
    match error {
        PfError::Ssh { message, .. } => format!("ssh: {}", message),
        PfError::Io { message, .. } => message.clone(),
        PfError::Timeout {
            operation,
            duration_secs,
        } => format!("{} timed out after {}s", operation, duration_secs),
        PfError::Cancelled { operation } => format!("{} cancelled", operation),
        other => other
            .to_string()
            .lines()
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let mut err = ParseError::new(ParseErrorKind::UnknownVerb, 12, "unknown verb 'pakages'")
            .with_suggestion("Did you mean 'packages'?");
        err.file = Some(PathBuf::from("Pfyfile.pf"));

        let output = format!("{}", PfError::from(err));
        let clean_output = console::strip_ansi_codes(&output);

        assert!(clean_output.contains("unknown verb"));
        assert!(clean_output.contains("Pfyfile.pf:12"));
        assert!(clean_output.contains("packages"));
    }

    #[test]
    fn test_cycle_display_lists_chain() {
        let err = PfError::Cycle {
            chain: vec![
                PathBuf::from("/srv/a.pf"),
                PathBuf::from("/srv/b.pf"),
                PathBuf::from("/srv/a.pf"),
            ],
        };

        let output = format!("{}", err);
        let clean_output = console::strip_ansi_codes(&output);
        assert!(clean_output.contains("include cycle"));
        assert!(clean_output.contains("-> /srv/b.pf"));
    }

    #[test]
    fn test_step_error_display_names_task_and_line() {
        let err = StepError {
            target: "ops@h1:22".to_string(),
            task: "deploy".to_string(),
            line: 4,
            step: "shell systemctl restart app".to_string(),
            exit_code: Some(3),
            message: "exit code 3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "deploy:4 (shell systemctl restart app): exit code 3"
        );
    }

    #[test]
    fn test_short_message_is_single_line() {
        let err = PfError::HostResolution {
            entry: "nope".to_string(),
            message: "unknown environment 'nope'".to_string(),
            suggestion: Some("check pf.yaml".to_string()),
        };
        let msg = short_message(&err);
        assert!(!msg.contains('\n'));
        assert!(console::strip_ansi_codes(&msg).contains("unknown environment"));
    }
}
