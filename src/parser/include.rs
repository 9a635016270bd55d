// Include resolution: load a root .pf file and everything it includes into
// one catalog.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::ast::{Catalog, Document};
use super::dsl::parse_document;
use crate::output::errors::PfError;

/// Loads .pf files and merges them into a [`Catalog`]
///
/// `stack` holds the canonical paths of files currently being expanded; a
/// file that reappears on it is a cycle. `loaded` holds every file already
/// merged, so a file reached twice through different branches is merged once.
#[derive(Debug, Default)]
pub struct IncludeResolver {
    stack: Vec<PathBuf>,
    loaded: HashSet<PathBuf>,
    catalog: Catalog,
}

impl IncludeResolver {
    pub fn new() -> Self {
        IncludeResolver::default()
    }

    /// Load `root` and all files it transitively includes
    pub fn load(mut self, root: &Path) -> Result<Catalog, PfError> {
        let canonical = root.canonicalize().map_err(|e| PfError::Io {
            message: format!("Failed to open task file: {}", e),
            path: Some(root.to_path_buf()),
        })?;
        self.load_file(&canonical)?;
        Ok(self.catalog)
    }

    fn load_file(&mut self, path: &Path) -> Result<(), PfError> {
        if self.stack.iter().any(|p| p == path) {
            let mut chain = self.stack.clone();
            chain.push(path.to_path_buf());
            return Err(PfError::Cycle { chain });
        }

        if !self.loaded.insert(path.to_path_buf()) {
            debug!(file = %path.display(), "already loaded, skipping");
            return Ok(());
        }

        let source = std::fs::read_to_string(path).map_err(|e| PfError::Io {
            message: format!("Failed to read task file: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        debug!(file = %path.display(), depth = self.stack.len(), "loading task file");

        self.stack.push(path.to_path_buf());
        let doc = parse_with_origin(&source, path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        self.merge(doc, path, base)?;
        self.stack.pop();

        Ok(())
    }

    fn merge(&mut self, doc: Document, origin: &Path, base: &Path) -> Result<(), PfError> {
        self.catalog.record_file(origin);

        for mut task in doc.tasks {
            task.source = origin.to_path_buf();
            if let Err(existing) = self.catalog.insert(task.clone()) {
                return Err(PfError::DuplicateTask {
                    name: task.name,
                    first: existing.source.clone(),
                    first_line: existing.line,
                    second: origin.to_path_buf(),
                    second_line: task.line,
                });
            }
        }

        for include in doc.includes {
            let target = resolve_include_path(base, &include.path);
            let canonical = match target.canonicalize() {
                Ok(p) if p.is_file() => p,
                _ => {
                    return Err(PfError::IncludeNotFound {
                        path: target,
                        included_from: origin.to_path_buf(),
                        line: include.line,
                    })
                }
            };
            self.load_file(&canonical)?;
        }

        Ok(())
    }
}

/// Load a root .pf file and its includes into one catalog
pub fn load_catalog(root: &Path) -> Result<Catalog, PfError> {
    IncludeResolver::new().load(root)
}

fn resolve_include_path(base: &Path, include: &str) -> PathBuf {
    let path = Path::new(include);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn parse_with_origin(source: &str, origin: &Path) -> Result<Document, PfError> {
    parse_document(source).map_err(|mut err| {
        err.file = Some(origin.to_path_buf());
        PfError::from(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_merges_nested_includes_relative_to_includer() {
        let dir = TempDir::new().unwrap();
        let root = write(
            dir.path(),
            "Pfyfile.pf",
            "include stacks/web.pf\ntask root_task\n  shell true\nend\n",
        );
        write(
            dir.path(),
            "stacks/web.pf",
            "include \"common/base.pf\"\ntask web\n  shell true\nend\n",
        );
        write(
            dir.path(),
            "stacks/common/base.pf",
            "task base\n  describe shared base\n  shell true\nend\n",
        );

        let catalog = load_catalog(&root).unwrap();
        let names: Vec<&str> = catalog.names().collect();
        assert_eq!(names, vec!["root_task", "web", "base"]);
        assert_eq!(catalog.files().len(), 3);
        assert!(catalog.get("base").unwrap().source.ends_with("stacks/common/base.pf"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let dir = TempDir::new().unwrap();
        let root = write(dir.path(), "a.pf", "include b.pf\ntask a\n  shell true\nend\n");
        write(dir.path(), "b.pf", "include a.pf\ntask b\n  shell true\nend\n");

        match load_catalog(&root) {
            Err(PfError::Cycle { chain }) => {
                assert_eq!(chain.len(), 3);
                assert_eq!(chain.first(), chain.last());
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_include_is_a_cycle() {
        let dir = TempDir::new().unwrap();
        let root = write(dir.path(), "a.pf", "include a.pf\n");
        assert!(matches!(load_catalog(&root), Err(PfError::Cycle { .. })));
    }

    #[test]
    fn test_duplicate_across_files_is_rejected() {
        let dir = TempDir::new().unwrap();
        let root = write(dir.path(), "a.pf", "include b.pf\ntask deploy\n  shell true\nend\n");
        write(dir.path(), "b.pf", "task deploy\n  shell false\nend\n");

        match load_catalog(&root) {
            Err(PfError::DuplicateTask {
                name,
                first,
                second,
                ..
            }) => {
                assert_eq!(name, "deploy");
                assert!(first.ends_with("a.pf"));
                assert!(second.ends_with("b.pf"));
            }
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_diamond_include_loads_once() {
        let dir = TempDir::new().unwrap();
        let root = write(dir.path(), "root.pf", "include left.pf\ninclude right.pf\n");
        write(dir.path(), "left.pf", "include shared.pf\n");
        write(dir.path(), "right.pf", "include shared.pf\n");
        write(dir.path(), "shared.pf", "task shared\n  shell true\nend\n");

        let catalog = load_catalog(&root).unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_missing_include_reports_includer() {
        let dir = TempDir::new().unwrap();
        let root = write(dir.path(), "root.pf", "\ninclude missing.pf\n");

        match load_catalog(&root) {
            Err(PfError::IncludeNotFound {
                path,
                included_from,
                line,
            }) => {
                assert!(path.ends_with("missing.pf"));
                assert!(included_from.ends_with("root.pf"));
                assert_eq!(line, 2);
            }
            other => panic!("expected include-not-found, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_carries_file() {
        let dir = TempDir::new().unwrap();
        let root = write(dir.path(), "root.pf", "include bad.pf\n");
        write(dir.path(), "bad.pf", "task x\n  frobnicate\nend\n");

        match load_catalog(&root) {
            Err(PfError::Parse(err)) => {
                assert!(err.file.unwrap().ends_with("bad.pf"));
                assert_eq!(err.line, 2);
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
