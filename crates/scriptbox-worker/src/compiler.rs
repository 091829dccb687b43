//! Compilation manager.
//!
//! `run_code` source is written to the module slot, read back, compiled and
//! evaluated by the embedded toolchain. Diagnostics from both phases are
//! collected; a module is only emitted when the toolchain did not skip
//! emission.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use rhai::module_resolvers::FileModuleResolver;
use rhai::{Engine, EvalAltResult, FnAccess, ParseError, Position, Scope};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::ToolchainOptions;
use crate::error::{Result, WorkerError};
use crate::sandbox::{CoverHook, ModuleUnit, COVER_FN, HOOK_SOURCE};

/// A toolchain-reported issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based `(line, column)`, when the toolchain knows it.
    pub position: Option<(usize, usize)>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            position: None,
            message: message.into(),
        }
    }

    pub fn at(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            position: Some((line, column)),
            message: message.into(),
        }
    }

    fn located(pos: Position, message: String) -> Self {
        match pos.line() {
            Some(line) => Self::at(line, pos.position().unwrap_or(0), message),
            None => Self::new(message),
        }
    }

    /// Pre-emit diagnostic from a parse failure.
    pub fn from_parse(err: &ParseError) -> Self {
        Self::located(err.position(), err.err_type().to_string())
    }

    /// Emit-time diagnostic from a failure while evaluating the module.
    pub fn from_eval(err: &EvalAltResult) -> Self {
        let pos = err.position();
        let text = err.to_string();
        // Engine errors append " (<position>)"; the position is kept separately.
        let suffix = format!(" ({})", pos);
        let message = match text.strip_suffix(&suffix) {
            Some(stripped) if !pos.is_none() => stripped.to_string(),
            _ => text,
        };
        Self::located(pos, message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some((line, column)) => write!(f, "{},{}: {}", line, column, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome of one toolchain run.
pub struct Emit {
    /// Every diagnostic, pre-emit first.
    pub diagnostics: Vec<Diagnostic>,
    /// The loaded module; `None` when emission was skipped.
    pub module: Option<ModuleUnit>,
}

/// Drives the embedded toolchain with fixed options.
pub struct Compiler {
    options: ToolchainOptions,
    engine: Rc<Engine>,
}

impl Compiler {
    pub fn new(options: ToolchainOptions) -> Self {
        let mut engine = Engine::new();
        engine.set_strict_variables(options.strict_variables);
        if let Some(levels) = options.max_call_levels {
            engine.set_max_call_levels(levels);
        }
        if let Some(operations) = options.max_operations {
            engine.set_max_operations(operations);
        }
        if let Some(base) = &options.base_path {
            engine.set_module_resolver(FileModuleResolver::new_with_path(base));
        }

        Self {
            options,
            engine: Rc::new(engine),
        }
    }

    pub fn module_slot(&self) -> PathBuf {
        self.options.module_slot()
    }

    /// Write source to the module slot, replacing what was there.
    pub fn persist(&self, source: &str) -> io::Result<PathBuf> {
        let slot = self.module_slot();
        fs::write(&slot, source)?;
        Ok(slot)
    }

    /// Compile and evaluate the module slot.
    ///
    /// Only I/O failures are returned as errors; toolchain problems are
    /// reported as diagnostics.
    pub fn build(&self, is_checking: bool) -> io::Result<Emit> {
        let source = fs::read_to_string(self.module_slot())?;
        let mut diagnostics = Vec::new();

        let mut scope = Scope::new();
        scope.push_constant("is_checking", is_checking);

        let mut ast = match self.engine.compile_with_scope(&scope, &source) {
            Ok(ast) => ast,
            Err(err) => {
                diagnostics.push(Diagnostic::from_parse(&err));
                return Ok(Emit {
                    diagnostics,
                    module: None,
                });
            }
        };
        if self.options.inline_source_names {
            ast.set_source(self.options.module_name.as_str());
        }

        if let Err(err) = self.engine.run_ast_with_scope(&mut scope, &ast) {
            diagnostics.push(Diagnostic::from_eval(&err));
            if self.options.no_emit_on_error {
                return Ok(Emit {
                    diagnostics,
                    module: None,
                });
            }
        }

        let digest = hex::encode(Sha256::digest(source.as_bytes()));
        debug!(digest = %digest, "module emitted");
        let module = ModuleUnit::new(
            Rc::clone(&self.engine),
            ast,
            self.options.module_name.clone(),
            digest,
        );
        Ok(Emit {
            diagnostics,
            module: Some(module),
        })
    }

    /// Compile an instrumentation hook snippet on its own, without the
    /// module scope.
    pub fn compile_hook(&self, code: &str) -> Result<CoverHook> {
        let mut ast = self.engine.compile(code).map_err(|err| WorkerError::Compile {
            diagnostics: vec![Diagnostic::from_parse(&err)],
        })?;
        ast.set_source(HOOK_SOURCE);

        let has_cover = ast.iter_functions().any(|f| {
            f.name == COVER_FN && f.params.len() == 2 && matches!(f.access, FnAccess::Public)
        });
        if !has_cover {
            return Err(WorkerError::Compile {
                diagnostics: vec![Diagnostic::new(format!(
                    "instrumentation hook must define `fn {}(func, data)`",
                    COVER_FN
                ))],
            });
        }

        Ok(CoverHook::new(ast.clone_functions_only()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn compiler_in(dir: &TempDir) -> Compiler {
        Compiler::new(ToolchainOptions {
            module_dir: dir.path().to_path_buf(),
            ..ToolchainOptions::default()
        })
    }

    fn build_source(compiler: &Compiler, source: &str) -> Emit {
        compiler.persist(source).unwrap();
        compiler.build(false).unwrap()
    }

    #[test]
    fn test_diagnostic_formatting() {
        assert_eq!(Diagnostic::at(3, 7, "unexpected '}'").to_string(), "3,7: unexpected '}'");
        assert_eq!(Diagnostic::new("no position").to_string(), "no position");
    }

    #[test]
    fn test_persist_overwrites_slot() {
        let dir = TempDir::new().unwrap();
        let compiler = compiler_in(&dir);

        compiler.persist("fn a(x) { x }").unwrap();
        let slot = compiler.persist("fn b(x) { x }").unwrap();
        assert_eq!(slot, dir.path().join("module.rhai"));
        assert_eq!(fs::read_to_string(slot).unwrap(), "fn b(x) { x }");
    }

    #[test]
    fn test_build_exports_public_functions() {
        let dir = TempDir::new().unwrap();
        let compiler = compiler_in(&dir);

        let emit = build_source(
            &compiler,
            "fn add(a) { a.x + a.y }\nprivate fn helper(a) { a }\nfn twice(a) { a * 2 }",
        );
        assert!(emit.diagnostics.is_empty());
        let module = emit.module.unwrap();
        let names: Vec<&str> = module.exports().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["add", "twice"]);
        assert!(module.export("helper").is_none());
        assert!(module.defines("helper"));
        assert_eq!(module.digest().len(), 64);
    }

    #[test]
    fn test_parse_error_skips_emit_with_position() {
        let dir = TempDir::new().unwrap();
        let compiler = compiler_in(&dir);

        let emit = build_source(&compiler, "fn ok(a) { a }\nfn broken(a) { a + }");
        assert!(emit.module.is_none());
        assert_eq!(emit.diagnostics.len(), 1);
        let (line, _) = emit.diagnostics[0].position.unwrap();
        assert_eq!(line, 2);
    }

    #[test]
    fn test_strict_variables_rejects_undeclared() {
        let dir = TempDir::new().unwrap();
        let compiler = compiler_in(&dir);

        let emit = build_source(&compiler, "let y = undeclared + 1;");
        assert!(emit.module.is_none());
        assert_eq!(emit.diagnostics.len(), 1);
    }

    #[test]
    fn test_is_checking_visible_at_module_level() {
        let dir = TempDir::new().unwrap();
        let compiler = compiler_in(&dir);

        compiler.persist("if !is_checking { throw \"not checking\"; }").unwrap();
        assert!(compiler.build(true).unwrap().module.is_some());
        assert!(compiler.build(false).unwrap().module.is_none());
    }

    #[test]
    fn test_evaluation_error_is_emit_diagnostic() {
        let dir = TempDir::new().unwrap();
        let compiler = compiler_in(&dir);

        let emit = build_source(&compiler, "fn f(a) { a }\nthrow \"module init failed\";");
        assert!(emit.module.is_none());
        assert_eq!(emit.diagnostics.len(), 1);
        assert!(emit.diagnostics[0].message.contains("module init failed"));
        assert_eq!(emit.diagnostics[0].position.map(|p| p.0), Some(2));
    }

    #[test]
    fn test_evaluation_error_emits_when_not_strict() {
        let dir = TempDir::new().unwrap();
        let compiler = Compiler::new(ToolchainOptions {
            module_dir: dir.path().to_path_buf(),
            no_emit_on_error: false,
            ..ToolchainOptions::default()
        });

        let emit = build_source(&compiler, "fn f(a) { a }\nthrow \"late\";");
        assert_eq!(emit.diagnostics.len(), 1);
        assert!(emit.module.unwrap().export("f").is_some());
    }

    #[test]
    fn test_missing_slot_is_io_error() {
        let dir = TempDir::new().unwrap();
        let compiler = compiler_in(&dir);
        assert!(compiler.build(false).is_err());
    }

    #[test]
    fn test_compile_hook_requires_cover() {
        let dir = TempDir::new().unwrap();
        let compiler = compiler_in(&dir);

        assert!(compiler.compile_hook("fn cover(func, data) { func.call(data) }").is_ok());

        match compiler.compile_hook("fn wrap(func, data) { func.call(data) }") {
            Err(WorkerError::Compile { diagnostics }) => {
                assert!(diagnostics[0].message.contains("fn cover(func, data)"));
            }
            _ => panic!("expected compile error"),
        }

        assert!(matches!(
            compiler.compile_hook("fn cover(func, data) {"),
            Err(WorkerError::Compile { .. })
        ));
    }
}
