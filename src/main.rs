// pf CLI - run .pf tasks locally or across SSH hosts

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use pf::config::PfConfig;
use pf::executor::{DefaultConnector, Invocation, Scheduler, SchedulerConfig};
use pf::inventory::{HostDefaults, HostResolver, HostSelector, Target};
use pf::output::{OutputMultiplexer, PfError, TerminalOutput};
use pf::parser::{embedded_catalog, load_catalog, Catalog};

/// Default task file name, searched for upward from the current directory
const PFYFILE_NAME: &str = "Pfyfile.pf";

/// Exit status after an interrupt
const EXIT_INTERRUPTED: i32 = 130;

const USAGE: &str = "pf [env=NAME]* [hosts=..|host=..]* [user=..] [port=..] [sudo=true] [sudo_user=..] <task|list> [k=v ...] [next_task [k=v ...]]...";

#[derive(Parser)]
#[command(
    name = "pf",
    about = "Symbol-free task runner",
    version,
    disable_colored_help = true,
    term_width = 0,
    override_usage = USAGE,
)]
struct Cli {
    /// Path to the task file (overrides PFY_FILE and the upward search)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to pf.yaml (overrides PF_CONFIG and the file next to the Pfyfile)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode - only command output and errors
    #[arg(short, long)]
    quiet: bool,

    /// Host selectors, options, tasks and their parameters
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    };

    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "pf=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<i32, PfError> {
    let terminal = TerminalOutput::new(cli.verbose, cli.quiet);
    let request = CommandLine::parse(&cli.args)?;

    let pfyfile = find_pfyfile(cli.file.as_deref())?;
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("PF_CONFIG").map(PathBuf::from));

    let wants_help = matches!(
        request.tasks.first().map(String::as_str),
        None | Some("help") | Some("--help")
    );
    let wants_list = request.tasks.first().map(String::as_str) == Some("list");

    if wants_help {
        println!("Usage: {}", USAGE);
        println!();
    }

    let catalog = load_tasks(&pfyfile, cli.file.is_some())?;
    let config = PfConfig::discover(config_path.as_deref(), &pfyfile)?;
    debug!(
        pfyfile = %pfyfile.display(),
        tasks = catalog.len(),
        files = catalog.files().len(),
        "task catalog loaded"
    );

    if wants_help || wants_list {
        terminal.print_task_list(&catalog, &config.environments);
        return Ok(0);
    }

    let invocations = select_tasks(&catalog, &request.tasks, &request.globals)?;

    let targets = if request.selectors.is_empty() {
        vec![Target::Local]
    } else {
        HostResolver::new(config.environments.clone())
            .with_defaults(request.host_defaults())
            .resolve(&request.selectors)?
    };

    let scheduler_config = SchedulerConfig {
        max_parallel: config.parallelism(),
        step_timeout: config.step_timeout(),
        sudo: request.sudo || request.sudo_user.is_some(),
        sudo_user: request.sudo_user.clone(),
        package_manager: config.package_manager,
    };
    let scheduler = Scheduler::new(
        scheduler_config,
        Arc::new(DefaultConnector::new(&config.ssh)),
    );

    let names: Vec<String> = invocations.iter().map(|i| i.task.name.clone()).collect();
    terminal.print_run_header(&names, &targets);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            interrupt.cancel();
        }
    });

    let output = OutputMultiplexer::stdout(cli.quiet);
    let report = scheduler.run(&invocations, &targets, &output, &cancel).await;
    output.finish().await;

    terminal.print_recap(&report);

    Ok(if report.was_cancelled() || cancel.is_cancelled() {
        EXIT_INTERRUPTED
    } else if report.success() {
        0
    } else {
        1
    })
}

/// Leading option tokens plus the task part of the command line
#[derive(Debug, Default, PartialEq)]
struct CommandLine {
    selectors: Vec<HostSelector>,
    user: Option<String>,
    port: Option<u16>,
    sudo: bool,
    sudo_user: Option<String>,
    /// `key=value` tokens before the first task, applied to every task
    globals: HashMap<String, String>,
    /// First task name onwards
    tasks: Vec<String>,
}

impl CommandLine {
    fn parse(args: &[String]) -> Result<Self, PfError> {
        let mut line = CommandLine::default();

        for (i, arg) in args.iter().enumerate() {
            if arg == "--" {
                line.tasks = args[i + 1..].to_vec();
                break;
            }

            let Some((key, value)) = arg.split_once('=').filter(|_| !arg.starts_with("--"))
            else {
                line.tasks = args[i..].to_vec();
                break;
            };

            if let Some(selector) = HostSelector::parse(arg) {
                line.selectors.push(selector);
                continue;
            }

            match key {
                "user" => line.user = Some(value.to_string()),
                "port" => {
                    let port = value
                        .trim()
                        .parse::<u16>()
                        .ok()
                        .filter(|p| *p != 0)
                        .ok_or_else(|| PfError::HostResolution {
                            entry: arg.clone(),
                            message: "invalid port".to_string(),
                            suggestion: Some("Use a number between 1 and 65535".to_string()),
                        })?;
                    line.port = Some(port);
                }
                "sudo" | "become" => line.sudo = is_truthy(value),
                "sudo_user" | "become_user" => {
                    line.sudo_user = Some(value.to_string()).filter(|u| !u.is_empty())
                }
                _ => {
                    line.globals.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(line)
    }

    fn host_defaults(&self) -> HostDefaults {
        let mut defaults = HostDefaults::default();
        if let Some(ref user) = self.user {
            defaults.user = Some(user.clone());
        }
        if let Some(port) = self.port {
            defaults.port = port;
        }
        defaults
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Split `<task> [k=v]* [<task> [k=v]*]*` into invocations
///
/// Global parameters apply to every task; a task's own `k=v` tokens win.
fn select_tasks(
    catalog: &Catalog,
    tokens: &[String],
    globals: &HashMap<String, String>,
) -> Result<Vec<Invocation>, PfError> {
    let mut invocations: Vec<Invocation> = Vec::new();

    for token in tokens {
        let is_param = token.contains('=') && !token.starts_with("--");
        if is_param {
            if let (Some(current), Some((key, value))) =
                (invocations.last_mut(), token.split_once('='))
            {
                current.params.insert(key.to_string(), value.to_string());
                continue;
            }
        }

        let task = catalog.lookup(token).ok_or_else(|| PfError::UnknownTask {
            name: token.clone(),
            candidates: catalog.suggestions(token),
        })?;
        invocations.push(Invocation::new(task.clone(), globals.clone()));
    }

    Ok(invocations)
}

/// Load the task file plus the built-ins
///
/// Without a task file on disk the embedded one is used, unless the path was
/// given explicitly.
fn load_tasks(pfyfile: &Path, explicit: bool) -> Result<Catalog, PfError> {
    let catalog = if explicit || pfyfile.exists() {
        load_catalog(pfyfile)?
    } else {
        debug!(pfyfile = %pfyfile.display(), "no task file found, using the embedded one");
        embedded_catalog()?
    };
    catalog.with_builtins()
}

/// Locate the task file
///
/// `--file` wins. Otherwise `PFY_FILE` (default `Pfyfile.pf`) is used as-is
/// when absolute, or searched for from the current directory upward.
fn find_pfyfile(explicit: Option<&Path>) -> Result<PathBuf, PfError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let hint = std::env::var("PFY_FILE").unwrap_or_else(|_| PFYFILE_NAME.to_string());
    let cwd = std::env::current_dir().map_err(|e| PfError::Io {
        message: format!("Failed to read current directory: {}", e),
        path: None,
    })?;

    Ok(search_upward(&cwd, &hint))
}

/// First existing `start/.../name` walking toward the root, else `start/name`
fn search_upward(start: &Path, name: &str) -> PathBuf {
    let hint = Path::new(name);
    if hint.is_absolute() {
        return hint.to_path_buf();
    }

    start
        .ancestors()
        .map(|dir| dir.join(hint))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| start.join(hint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf::parser::parse_document;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    fn catalog(src: &str) -> Catalog {
        let mut catalog = Catalog::new();
        for task in parse_document(src).unwrap().tasks {
            catalog.insert(task).unwrap();
        }
        catalog
    }

    #[test]
    fn test_leading_tokens() {
        let line = CommandLine::parse(&args(&[
            "env=prod",
            "host=web1.example.com",
            "user=deploy",
            "port=2222",
            "become=yes",
            "tag=v2",
            "deploy",
            "port=8080",
        ]))
        .unwrap();

        assert_eq!(
            line.selectors,
            vec![
                HostSelector::Env("prod".to_string()),
                HostSelector::Host("web1.example.com".to_string()),
            ]
        );
        assert_eq!(line.user.as_deref(), Some("deploy"));
        assert_eq!(line.port, Some(2222));
        assert!(line.sudo);
        assert_eq!(line.globals.get("tag").map(String::as_str), Some("v2"));
        assert_eq!(line.tasks, args(&["deploy", "port=8080"]));

        let defaults = line.host_defaults();
        assert_eq!(defaults.port, 2222);
        assert_eq!(defaults.user.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_double_dash_ends_options() {
        let line = CommandLine::parse(&args(&["sudo=false", "--", "odd=name"])).unwrap();
        assert!(!line.sudo);
        assert_eq!(line.tasks, args(&["odd=name"]));
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let err = CommandLine::parse(&args(&["port=ssh", "deploy"])).unwrap_err();
        assert!(matches!(err, PfError::HostResolution { .. }));
    }

    #[test]
    fn test_multi_task_invocation_with_params() {
        let catalog = catalog(
            "task build\n  shell make\nend\ntask nginx_install port=80\n  packages install nginx\nend\n",
        );
        let mut globals = HashMap::new();
        globals.insert("env_name".to_string(), "prod".to_string());

        let invocations = select_tasks(
            &catalog,
            &args(&["build", "jobs=4", "nginx-install", "port=8080"]),
            &globals,
        )
        .unwrap();

        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].task.name, "build");
        assert_eq!(invocations[0].params.get("jobs").map(String::as_str), Some("4"));
        assert_eq!(invocations[0].params.get("env_name").map(String::as_str), Some("prod"));
        assert_eq!(invocations[1].task.name, "nginx_install");
        assert_eq!(invocations[1].params.get("port").map(String::as_str), Some("8080"));
        assert!(!invocations[1].params.contains_key("jobs"));
    }

    #[test]
    fn test_unknown_task_lists_candidates() {
        let catalog = catalog("task deploy\n  shell true\nend\n");
        let err = select_tasks(&catalog, &args(&["deplyo"]), &HashMap::new()).unwrap_err();
        match err {
            PfError::UnknownTask { name, candidates } => {
                assert_eq!(name, "deplyo");
                assert_eq!(candidates, vec!["deploy".to_string()]);
            }
            other => panic!("expected UnknownTask, got {:?}", other),
        }
    }

    #[test]
    fn test_pfyfile_found_in_parent_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PFYFILE_NAME), "task t\n  shell true\nend\n").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(
            search_upward(&nested, PFYFILE_NAME),
            dir.path().join(PFYFILE_NAME)
        );
        assert_eq!(
            search_upward(&nested, "/etc/other.pf"),
            PathBuf::from("/etc/other.pf")
        );
    }

    #[test]
    fn test_missing_task_file_falls_back_to_embedded() {
        let dir = TempDir::new().unwrap();
        let catalog = load_tasks(&dir.path().join(PFYFILE_NAME), false).unwrap();

        assert!(catalog.get("include_demo").is_some());
        assert!(catalog.get("nginx_install").unwrap().is_builtin());
        assert!(catalog.files().is_empty());
    }

    #[test]
    fn test_task_file_is_merged_over_builtins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PFYFILE_NAME);
        std::fs::write(&path, "task update\n  shell echo mine\nend\n").unwrap();

        let catalog = load_tasks(&path, false).unwrap();
        assert!(catalog.get("include_demo").is_none());
        assert!(!catalog.get("update").unwrap().is_builtin());
        assert!(catalog.get("upgrade").unwrap().is_builtin());

        let invocations =
            select_tasks(&catalog, &args(&["setup_venv"]), &HashMap::new()).unwrap();
        assert_eq!(invocations[0].task.name, "setup-venv");
    }

    #[test]
    fn test_explicit_missing_task_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = load_tasks(&dir.path().join("nope.pf"), true).unwrap_err();
        assert!(matches!(err, PfError::Io { .. }));
    }

    #[test]
    fn test_truthy_values() {
        for value in ["1", "true", "YES", "on"] {
            assert!(is_truthy(value), "{}", value);
        }
        for value in ["0", "false", "no", ""] {
            assert!(!is_truthy(value), "{}", value);
        }
    }
}
