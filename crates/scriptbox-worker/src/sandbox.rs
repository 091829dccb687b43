//! Execution sandbox.
//!
//! Holds the export table of an emitted module and invokes exports with a
//! single JSON argument, optionally routed through an instrumentation hook.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, FnAccess, FnPtr, FuncArgs, Map, Scope, AST};
use serde_json::Value;

use crate::error::{Result, WorkerError};
use crate::fault::Trace;

/// Name of the function an instrumentation hook must define.
pub const COVER_FN: &str = "cover";

/// Source label of instrumentation hook code.
pub const HOOK_SOURCE: &str = "cover.rhai";

const NATIVE_LOCATION: &str = "<native>";

/// A public function of the active module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub params: Vec<String>,
}

/// An emitted module and its export table.
pub struct ModuleUnit {
    engine: Rc<Engine>,
    ast: AST,
    exports: BTreeMap<String, Export>,
    defined: BTreeSet<String>,
    source_name: String,
    digest: String,
}

impl ModuleUnit {
    pub(crate) fn new(engine: Rc<Engine>, ast: AST, source_name: String, digest: String) -> Self {
        let mut exports = BTreeMap::new();
        let mut defined = BTreeSet::new();
        for f in ast.iter_functions() {
            defined.insert(f.name.to_string());
            if !matches!(f.access, FnAccess::Public) {
                continue;
            }
            let export = Export {
                name: f.name.to_string(),
                params: f.params.iter().map(|p| p.to_string()).collect(),
            };
            // Overloads: prefer the arity the sandbox calls with.
            match exports.get(f.name) {
                Some(Export { params, .. }) if params.len() == 1 => {}
                _ => {
                    exports.insert(export.name.clone(), export);
                }
            }
        }

        Self {
            engine,
            ast,
            exports,
            defined,
            source_name,
            digest,
        }
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    /// Exports in name order.
    pub fn exports(&self) -> impl Iterator<Item = &Export> {
        self.exports.values()
    }

    /// Whether the module defines `name`, exported or not.
    pub fn defines(&self, name: &str) -> bool {
        self.defined.contains(name)
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Hex SHA-256 of the module source.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }

    /// Call a function of this module directly.
    pub fn call(
        &self,
        name: &str,
        argument: Dynamic,
        this: &mut Dynamic,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        self.call_in(&self.ast, name, (argument,), this)
    }

    /// Call `name` in `ast`, which must carry this module's functions.
    pub fn call_in(
        &self,
        ast: &AST,
        name: &str,
        args: impl FuncArgs,
        this: &mut Dynamic,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).bind_this_ptr(this);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, ast, name, args)
    }
}

/// Values exposed to user functions as `this`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxContext {
    pub environment_id: String,
    pub is_checking: bool,
}

impl SandboxContext {
    fn to_dynamic(&self) -> Dynamic {
        let mut map = Map::new();
        map.insert("environment_id".into(), Dynamic::from(self.environment_id.clone()));
        map.insert("is_checking".into(), Dynamic::from(self.is_checking));
        Dynamic::from_map(map)
    }
}

/// Strategy for calling a user function.
pub trait Instrumentation {
    /// Short label for logs.
    fn name(&self) -> &str;

    fn invoke(
        &self,
        module: &ModuleUnit,
        function: &str,
        argument: Dynamic,
        this: &mut Dynamic,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>>;

    /// Function the engine is entered through when calling `function`.
    fn entry<'a>(&'a self, function: &'a str) -> &'a str {
        function
    }

    /// File a hook-defined function was compiled from.
    fn locate(&self, _function: &str) -> Option<&str> {
        None
    }
}

/// Calls the function with no wrapping.
#[derive(Debug, Default)]
pub struct DirectCall;

impl Instrumentation for DirectCall {
    fn name(&self) -> &str {
        "direct"
    }

    fn invoke(
        &self,
        module: &ModuleUnit,
        function: &str,
        argument: Dynamic,
        this: &mut Dynamic,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        module.call(function, argument, this)
    }
}

/// Routes every call through the hook's `cover(func, data)`.
pub struct CoverHook {
    ast: AST,
    functions: BTreeSet<String>,
}

impl CoverHook {
    pub(crate) fn new(ast: AST) -> Self {
        let functions = ast.iter_functions().map(|f| f.name.to_string()).collect();
        Self { ast, functions }
    }
}

impl Instrumentation for CoverHook {
    fn name(&self) -> &str {
        COVER_FN
    }

    fn invoke(
        &self,
        module: &ModuleUnit,
        function: &str,
        argument: Dynamic,
        this: &mut Dynamic,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let target = FnPtr::new(function)?;
        // Hook functions shadow module functions of the same name.
        let merged = module.ast().merge(&self.ast);
        module.call_in(&merged, COVER_FN, (target, argument), this)
    }

    fn entry<'a>(&'a self, _function: &'a str) -> &'a str {
        COVER_FN
    }

    fn locate(&self, function: &str) -> Option<&str> {
        self.functions.contains(function).then_some(HOOK_SOURCE)
    }
}

/// Invoke an export of `module` with `args` as its single argument.
pub fn invoke(
    module: &ModuleUnit,
    hook: &dyn Instrumentation,
    function: &str,
    args: &Value,
    context: &SandboxContext,
) -> Result<Value> {
    if module.export(function).is_none() {
        return Err(WorkerError::not_found(function));
    }

    let locate = |name: &str| -> String {
        match hook.locate(name) {
            Some(file) => file.to_string(),
            None if module.defines(name) => module.source_name().to_string(),
            None => NATIVE_LOCATION.to_string(),
        }
    };
    let entry = hook.entry(function);
    let fault = |err: Box<EvalAltResult>| WorkerError::RuntimeFault(Trace::from_eval(&err, entry, &locate));

    let argument = rhai::serde::to_dynamic(args).map_err(fault)?;
    let mut this = context.to_dynamic();
    let result = hook.invoke(module, function, argument, &mut this).map_err(fault)?;
    rhai::serde::from_dynamic::<Value>(&result).map_err(fault)
}
