// Line-oriented parser for the symbol-free .pf DSL
//
// Every logical line is dispatched on its leading keyword. A trailing
// backslash joins the next physical line onto the current one.

use super::ast::*;
use crate::output::errors::{ParseError, ParseErrorKind};

const VERBS: &[&str] = &[
    "shell",
    "packages",
    "service",
    "directory",
    "copy",
    "describe",
    "env",
];

/// A logical line: physical lines joined on trailing backslashes
struct LogicalLine {
    number: usize,
    text: String,
}

/// Parse .pf source text into tasks and include directives
pub fn parse_document(source: &str) -> Result<Document, ParseError> {
    let mut doc = Document::default();
    let mut current: Option<TaskDefinition> = None;

    for LogicalLine { number, text } in logical_lines(source) {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (keyword, rest) = split_keyword(trimmed);

        match keyword {
            "task" => {
                if let Some(ref open) = current {
                    return Err(ParseError::new(
                        ParseErrorKind::NestedTask,
                        number,
                        format!(
                            "'task' inside task '{}' (opened on line {})",
                            open.name, open.line
                        ),
                    )
                    .with_suggestion("Close the previous task with a lone 'end' line"));
                }
                current = Some(parse_task_header(rest, number)?);
            }

            "end" => {
                if !rest.is_empty() {
                    return Err(ParseError::new(
                        ParseErrorKind::MalformedStep,
                        number,
                        "'end' must stand alone on its line",
                    ));
                }
                match current.take() {
                    Some(task) => doc.tasks.push(task),
                    None => {
                        return Err(ParseError::new(
                            ParseErrorKind::UnexpectedEnd,
                            number,
                            "'end' without a matching 'task'",
                        ))
                    }
                }
            }

            "include" => {
                if current.is_some() {
                    return Err(ParseError::new(
                        ParseErrorKind::MalformedStep,
                        number,
                        "'include' is only allowed outside tasks",
                    ));
                }
                let tokens = tokenize(rest, number)?;
                match tokens.as_slice() {
                    [path] => doc.includes.push(IncludeDirective {
                        path: path.clone(),
                        line: number,
                    }),
                    _ => {
                        return Err(ParseError::new(
                            ParseErrorKind::MalformedStep,
                            number,
                            "include expects exactly one path",
                        )
                        .with_suggestion("include \"stacks/web.pf\""))
                    }
                }
            }

            _ => {
                let Some(task) = current.as_mut() else {
                    return Err(ParseError::new(
                        ParseErrorKind::OutsideTask,
                        number,
                        format!("'{}' outside of a task", keyword),
                    )
                    .with_suggestion("Only 'task' and 'include' may appear at the top level"));
                };

                let kind = parse_step(keyword, rest, number)?;
                if let StepKind::Describe { ref text } = kind {
                    if task.description.is_none() {
                        task.description = Some(text.clone());
                    }
                }
                task.steps.push(Step { kind, line: number });
            }
        }
    }

    if let Some(task) = current {
        return Err(ParseError::new(
            ParseErrorKind::UnterminatedTask,
            task.line,
            format!("task '{}' is missing its 'end' line", task.name),
        ));
    }

    Ok(doc)
}

fn logical_lines(source: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut pending: Option<LogicalLine> = None;

    for (idx, raw) in source.lines().enumerate() {
        let number = idx + 1;
        let (body, continues) = match raw.trim_end().strip_suffix('\\') {
            Some(body) => (body.trim_end(), true),
            None => (raw.trim_end(), false),
        };

        let line = match pending.take() {
            Some(mut open) => {
                let piece = body.trim_start();
                if !piece.is_empty() {
                    if !open.text.is_empty() {
                        open.text.push(' ');
                    }
                    open.text.push_str(piece);
                }
                open
            }
            None => LogicalLine {
                number,
                text: body.to_string(),
            },
        };

        if continues {
            pending = Some(line);
        } else {
            lines.push(line);
        }
    }

    // A backslash on the final line continues into nothing
    lines.extend(pending);
    lines
}

fn split_keyword(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (line, ""),
    }
}

fn tokenize(text: &str, line: usize) -> Result<Vec<String>, ParseError> {
    shlex::split(text).ok_or_else(|| {
        ParseError::new(
            ParseErrorKind::MalformedStep,
            line,
            format!("unbalanced quotes in '{}'", text),
        )
    })
}

fn parse_task_header(rest: &str, line: usize) -> Result<TaskDefinition, ParseError> {
    let tokens = tokenize(rest, line)?;
    let Some((name, params)) = tokens.split_first() else {
        return Err(ParseError::new(
            ParseErrorKind::MalformedStep,
            line,
            "task name missing",
        ));
    };

    if name.contains('=') {
        return Err(ParseError::new(
            ParseErrorKind::MalformedStep,
            line,
            format!("'{}' is not a valid task name", name),
        ));
    }

    let mut task = TaskDefinition::new(name.clone(), line);
    for token in params {
        let (key, value) = split_assignment(token).ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::MalformedStep,
                line,
                format!("unexpected '{}' after task name; expected key=value", token),
            )
        })?;
        task.params.push((key, value));
    }
    Ok(task)
}

fn split_assignment(token: &str) -> Option<(String, String)> {
    let (key, value) = token.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

fn parse_step(verb: &str, rest: &str, line: usize) -> Result<StepKind, ParseError> {
    match verb {
        "shell" => parse_shell(rest, line),
        "packages" => parse_packages(rest, line),
        "service" => parse_service(rest, line),
        "directory" => parse_directory(rest, line),
        "copy" => parse_copy(rest, line),
        "describe" => {
            if rest.is_empty() {
                return Err(ParseError::new(
                    ParseErrorKind::MalformedStep,
                    line,
                    "describe needs some text",
                ));
            }
            Ok(StepKind::Describe {
                text: rest.to_string(),
            })
        }
        "env" => parse_env(rest, line),
        other => {
            let mut err = ParseError::new(
                ParseErrorKind::UnknownVerb,
                line,
                format!("unknown verb '{}'", other),
            );
            if let Some(close) = closest_verb(other) {
                err = err.with_suggestion(format!("Did you mean '{}'?", close));
            }
            Err(err)
        }
    }
}

/// `shell [sudo=true] [sudo_user=name] <command...>`
///
/// Modifiers are only recognized as leading tokens; the rest of the line is
/// kept verbatim so the target shell sees quotes and pipes untouched.
fn parse_shell(rest: &str, line: usize) -> Result<StepKind, ParseError> {
    let mut sudo = None;
    let mut sudo_user = None;
    let mut command = rest;

    loop {
        let (token, tail) = split_keyword(command);
        if let Some(value) = token.strip_prefix("sudo=") {
            sudo = Some(parse_bool(value).ok_or_else(|| {
                ParseError::new(
                    ParseErrorKind::InvalidModifier,
                    line,
                    format!("sudo expects true or false, got '{}'", value),
                )
            })?);
        } else if let Some(value) = token.strip_prefix("sudo_user=") {
            if value.is_empty() {
                return Err(ParseError::new(
                    ParseErrorKind::InvalidModifier,
                    line,
                    "sudo_user needs a user name",
                ));
            }
            sudo_user = Some(value.to_string());
        } else {
            break;
        }
        command = tail;
    }

    if command.is_empty() {
        return Err(ParseError::new(
            ParseErrorKind::MalformedStep,
            line,
            "shell needs a command",
        ));
    }

    Ok(StepKind::ShellCommand {
        command: command.to_string(),
        sudo,
        sudo_user,
    })
}

fn parse_packages(rest: &str, line: usize) -> Result<StepKind, ParseError> {
    let tokens = tokenize(rest, line)?;
    let usage = || {
        ParseError::new(
            ParseErrorKind::MalformedStep,
            line,
            "packages expects 'install' or 'remove' followed by package names",
        )
        .with_suggestion("packages install nginx curl")
    };

    let (action, names) = tokens.split_first().ok_or_else(usage)?;
    if names.is_empty() {
        return Err(usage());
    }

    let packages = names.to_vec();
    match action.as_str() {
        "install" => Ok(StepKind::PackagesInstall { packages }),
        "remove" => Ok(StepKind::PackagesRemove { packages }),
        _ => Err(usage()),
    }
}

fn parse_service(rest: &str, line: usize) -> Result<StepKind, ParseError> {
    let tokens = tokenize(rest, line)?;
    match tokens.as_slice() {
        [action, name] => {
            let action = ServiceAction::parse(action).ok_or_else(|| {
                ParseError::new(
                    ParseErrorKind::MalformedStep,
                    line,
                    format!("unknown service action '{}'", action),
                )
                .with_suggestion("Use one of: start, stop, enable, disable, restart")
            })?;
            Ok(StepKind::ServiceAction {
                action,
                name: name.clone(),
            })
        }
        _ => Err(ParseError::new(
            ParseErrorKind::MalformedStep,
            line,
            "service expects an action and exactly one service name",
        )
        .with_suggestion("service restart nginx")),
    }
}

/// Split tokens into positionals and `key=value` modifiers, rejecting keys
/// outside `allowed`.
fn split_modifiers(
    tokens: Vec<String>,
    allowed: &[&str],
    verb: &str,
    line: usize,
) -> Result<(Vec<String>, Vec<(String, String)>), ParseError> {
    let mut positional = Vec::new();
    let mut modifiers: Vec<(String, String)> = Vec::new();

    for token in tokens {
        match split_assignment(&token) {
            Some((key, value)) => {
                if !allowed.contains(&key.as_str()) {
                    return Err(ParseError::new(
                        ParseErrorKind::InvalidModifier,
                        line,
                        format!("unknown {} option '{}'", verb, key),
                    )
                    .with_suggestion(format!("Allowed options: {}", allowed.join(", "))));
                }
                // Interpolated modes are checked once their value is known
                if key == "mode" && !value.contains('$') && !is_octal_mode(&value) {
                    return Err(ParseError::new(
                        ParseErrorKind::InvalidModifier,
                        line,
                        format!("mode '{}' is not an octal permission", value),
                    )
                    .with_suggestion("mode=0755"));
                }
                modifiers.retain(|(k, _)| k != &key);
                modifiers.push((key, value));
            }
            None => positional.push(token),
        }
    }

    Ok((positional, modifiers))
}

fn take_modifier(modifiers: &[(String, String)], key: &str) -> Option<String> {
    modifiers
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

fn parse_directory(rest: &str, line: usize) -> Result<StepKind, ParseError> {
    let tokens = tokenize(rest, line)?;
    let (positional, modifiers) = split_modifiers(tokens, &["mode"], "directory", line)?;

    match positional.as_slice() {
        [path] => Ok(StepKind::DirectoryEnsure {
            path: path.clone(),
            mode: take_modifier(&modifiers, "mode"),
        }),
        _ => Err(ParseError::new(
            ParseErrorKind::MalformedStep,
            line,
            "directory expects exactly one path",
        )
        .with_suggestion("directory /srv/app mode=0755")),
    }
}

fn parse_copy(rest: &str, line: usize) -> Result<StepKind, ParseError> {
    let tokens = tokenize(rest, line)?;
    let (positional, modifiers) =
        split_modifiers(tokens, &["mode", "user", "group"], "copy", line)?;

    match positional.as_slice() {
        [local, remote] => Ok(StepKind::CopyFile {
            local: local.clone(),
            remote: remote.clone(),
            mode: take_modifier(&modifiers, "mode"),
            user: take_modifier(&modifiers, "user"),
            group: take_modifier(&modifiers, "group"),
        }),
        _ => Err(ParseError::new(
            ParseErrorKind::MalformedStep,
            line,
            "copy expects a local path and a remote path",
        )
        .with_suggestion("copy ./nginx.conf /etc/nginx/nginx.conf mode=0644 user=root")),
    }
}

fn parse_env(rest: &str, line: usize) -> Result<StepKind, ParseError> {
    let tokens = tokenize(rest, line)?;
    if tokens.is_empty() {
        return Err(ParseError::new(
            ParseErrorKind::MalformedStep,
            line,
            "env needs at least one KEY=VALUE",
        ));
    }

    let assignments = tokens
        .iter()
        .map(|token| {
            split_assignment(token)
                .filter(|(key, _)| is_identifier(key))
                .ok_or_else(|| {
                    ParseError::new(
                        ParseErrorKind::MalformedStep,
                        line,
                        format!("'{}' is not a KEY=VALUE assignment", token),
                    )
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StepKind::EnvSet { assignments })
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn is_octal_mode(mode: &str) -> bool {
    (3..=4).contains(&mode.len()) && mode.chars().all(|c| ('0'..='7').contains(&c))
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn closest_verb(word: &str) -> Option<&'static str> {
    VERBS
        .iter()
        .copied()
        .map(|verb| (edit_distance(verb, word), verb))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, verb)| verb)
}

/// Levenshtein distance over chars
pub(crate) fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut row = Vec::with_capacity(b.len() + 1);
        row.push(i + 1);
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            row.push((prev[j] + cost).min(prev[j + 1] + 1).min(row[j] + 1));
        }
        prev = row;
    }

    prev[b.len()]
}
