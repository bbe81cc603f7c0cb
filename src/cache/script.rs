//! ScriptCache (spec.md §4.1): maps script path to parsed `Program`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, ParseError};
use crate::value::{Evaluator, Program};

pub struct ScriptCache {
    dev_mode: bool,
    programs: DashMap<PathBuf, Program>,
    evaluator: Arc<dyn Evaluator>,
}

impl ScriptCache {
    pub fn new(dev_mode: bool, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            dev_mode,
            programs: DashMap::new(),
            evaluator,
        }
    }

    /// `getAST(path) → Program | ParseError`.
    ///
    /// In development mode, every call re-reads and re-parses the file
    /// (transparent cache). In production, the first call parses and
    /// memoizes; subsequent calls return the stored Program.
    pub fn get_ast(&self, path: &Path) -> Result<Program, Error> {
        if !self.dev_mode {
            if let Some(program) = self.programs.get(path) {
                return Ok(program.clone());
            }
        }

        let source = std::fs::read_to_string(path).map_err(Error::Transport)?;
        let program = self
            .evaluator
            .parse(&source, path)
            .map_err(Error::Parse)?;

        if !self.dev_mode {
            self.programs.insert(path.to_path_buf(), program.clone());
        }

        Ok(program)
    }

    pub fn clear(&self) {
        self.programs.clear();
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Environment, NullEvaluator, Value};
    use std::io::Write;

    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn production_mode_memoizes_after_first_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "a.pars", "one");

        let evaluator = Arc::new(NullEvaluator { result: Value::Null });
        let cache = ScriptCache::new(false, evaluator);

        cache.get_ast(&path).unwrap();
        assert_eq!(cache.len(), 1);

        std::fs::write(&path, "two").unwrap();
        // Still memoized: len unchanged, no re-read required to succeed.
        cache.get_ast(&path).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dev_mode_never_memoizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "a.pars", "one");

        let evaluator = Arc::new(NullEvaluator { result: Value::Null });
        let cache = ScriptCache::new(true, evaluator);

        cache.get_ast(&path).unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn missing_file_surfaces_transport_error() {
        let evaluator = Arc::new(NullEvaluator { result: Value::Null });
        let cache = ScriptCache::new(false, evaluator);
        let result = cache.get_ast(Path::new("/nonexistent/path.pars"));
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn clear_empties_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "a.pars", "one");
        let evaluator = Arc::new(NullEvaluator { result: Value::Null });
        let cache = ScriptCache::new(false, evaluator);
        cache.get_ast(&path).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn program_never_references_environment() {
        // Compile-time shape check for invariant 1 (spec.md §3): Program
        // construction takes no Environment argument.
        let _env = Environment::new(PathBuf::from("/tmp"));
        let _program = Program::new(42usize);
    }
}
