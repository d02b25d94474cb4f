use crate::{EngineError, EngineOptions, ExecutionError, ScriptEngine};
use log::debug;
use rustpython_vm::builtins::PyBaseExceptionRef;
use rustpython_vm::function::FuncArgs;
use rustpython_vm::scope::Scope;
use rustpython_vm::{AsObject, Interpreter, PyObjectRef, PyResult, Settings, VirtualMachine};
use std::collections::BTreeSet;

/// Modules that hand out the interpreter itself or the host. Always denied,
/// whatever the configured list says.
const INTERPRETER_MODULES: &[&str] = &[
    "sys",
    "_imp",
    "importlib",
    "_frozen_importlib",
    "_frozen_importlib_external",
    "_io",
    "io",
    "posix",
    "nt",
    "_posixsubprocess",
    "_socket",
    "select",
    "mmap",
    "fcntl",
    "resource",
    "pwd",
    "grp",
    "termios",
    "_thread",
    "_signal",
    "gc",
    "marshal",
    "_ast",
    "ast",
    "_operator",
    "operator",
    "faulthandler",
    "_winapi",
    "msvcrt",
    "winreg",
];

/// Attributes that walk from a plain object to types, frames or globals.
const BLOCKED_NAMES: &[&str] = &[
    "__subclasses__",
    "__bases__",
    "__base__",
    "__mro__",
    "mro",
    "__globals__",
    "__closure__",
    "__code__",
    "__dict__",
    "__getattribute__",
    "__reduce__",
    "__reduce_ex__",
    "__loader__",
    "__spec__",
    "__traceback__",
    "tb_frame",
    "tb_next",
    "f_back",
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_code",
    "gi_frame",
    "gi_code",
    "cr_frame",
    "ag_frame",
];

// Runs in a scope of its own; user code never sees these names.
const SANDBOX_PRELUDE: &str = r#"
__name__ = "esai_sandbox"
import sys

class Capture:
    def __init__(self):
        self._parts = []

    def write(self, text):
        text = str(text)
        self._parts.append(text)
        return len(text)

    def writelines(self, lines):
        for line in lines:
            self.write(line)

    def flush(self):
        pass

    def isatty(self):
        return False

    def drain(self):
        out = "".join(self._parts)
        self._parts = []
        return out

capture = Capture()

def rebind():
    global capture
    capture = Capture()
    sys.stdout = capture
    sys.stderr = capture

def drain():
    return capture.drain()

def evict():
    for name in list(sys.modules):
        if name.partition(".")[0] in DENIED:
            del sys.modules[name]
"#;

/// RustPython interpreter with one persistent `__main__` scope.
///
/// Output capture and module eviction live in a second, private scope. The
/// import guard and the builtin wrappers are native functions, so the real
/// importer and the unwrapped builtins are only reachable from Rust.
///
/// Not `Send`: the session keeps it on a dedicated worker thread.
pub struct PythonEngine {
    interpreter: Interpreter,
    scope: Scope,
    sandbox: Scope,
}

impl PythonEngine {
    pub fn new(options: &EngineOptions) -> Result<Self, EngineError> {
        validate_module_names(options)?;
        let denied = denied_modules(options);

        let interpreter = Interpreter::with_init(Settings::default(), |vm| {
            vm.add_native_modules(rustpython_stdlib::get_module_inits());
        });
        let (sandbox, scope) = interpreter
            .enter(|vm| {
                install_sandbox(vm, options, &denied).map_err(|exc| describe_exception(vm, &exc))
            })
            .map_err(EngineError::Bootstrap)?;
        let engine = Self {
            interpreter,
            scope,
            sandbox,
        };

        for module in &options.preload {
            engine
                .run_in(&engine.scope, &format!("import {module}"), "<esai-preload>")
                .map_err(EngineError::Bootstrap)?;
        }
        debug!(
            "python engine ready (preload={:?}, denied={})",
            options.preload,
            denied.len()
        );
        Ok(engine)
    }

    fn run_in(&self, scope: &Scope, source: &str, source_name: &str) -> Result<(), String> {
        let scope = scope.clone();
        self.interpreter.enter(|vm| {
            vm.run_code_string(scope, source, source_name.to_owned())
                .map(drop)
                .map_err(|exc| describe_exception(vm, &exc))
        })
    }
}

impl ScriptEngine for PythonEngine {
    fn rebind_output(&mut self) -> Result<(), EngineError> {
        // Cached modules skip `__import__`, so denied ones are evicted per run.
        self.run_in(&self.sandbox, "rebind()\nevict()", "<esai-rebind>")
            .map_err(EngineError::Capture)
    }

    fn execute(&mut self, source: &str, source_name: &str) -> Result<(), EngineError> {
        if let Some(name) = find_blocked_name(source) {
            return Err(ExecutionError {
                message: format!("PermissionError: {}", blocked_message(name)),
            }
            .into());
        }
        self.run_in(&self.scope, source, source_name)
            .map_err(|message| ExecutionError { message }.into())
    }

    fn drain_output(&mut self) -> Result<String, EngineError> {
        let sandbox = self.sandbox.clone();
        self.interpreter.enter(|vm| {
            let drained = vm
                .run_code_string(sandbox.clone(), "drained = drain()", "<esai-drain>".to_owned())
                .and_then(|_| sandbox.globals.get_item("drained", vm))
                .and_then(|value| value.str(vm));
            match drained {
                Ok(text) => Ok(text.as_str().to_owned()),
                Err(exc) => Err(EngineError::Capture(describe_exception(vm, &exc))),
            }
        })
    }
}

fn install_sandbox(
    vm: &VirtualMachine,
    options: &EngineOptions,
    denied: &BTreeSet<String>,
) -> PyResult<(Scope, Scope)> {
    // The prelude imports `sys` before the guard goes in.
    let sandbox = vm.new_scope_with_builtins();
    vm.run_code_string(
        sandbox.clone(),
        &sandbox_prelude(denied),
        "<esai-sandbox>".to_owned(),
    )?;

    install_import_guard(vm, denied.clone())?;
    if !options.allow_file_access {
        block_builtin(vm, "open", "file access is not available in the sandbox")?;
    }
    for name in ["getattr", "hasattr", "setattr", "delattr"] {
        wrap_builtin(vm, name, check_attribute_name)?;
    }
    wrap_builtin(vm, "vars", check_vars_argument)?;
    for name in ["exec", "eval", "compile"] {
        wrap_builtin(vm, name, check_source_argument)?;
    }
    vm.run_code_string(sandbox.clone(), "rebind()\nevict()", "<esai-sandbox>".to_owned())?;

    let scope = vm.new_scope_with_builtins();
    scope
        .globals
        .set_item("__name__", vm.ctx.new_str("__main__").into(), vm)?;
    Ok((sandbox, scope))
}

fn install_import_guard(vm: &VirtualMachine, denied: BTreeSet<String>) -> PyResult<()> {
    let original_import = vm.builtins.get_attr("__import__", vm)?;
    let guard = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let name = args
                .args
                .first()
                .and_then(|value| value.str(vm).ok())
                .map(|value| value.as_str().to_owned())
                .unwrap_or_default();
            if is_denied(&name, &denied) {
                return Err(vm.new_import_error(
                    format!("import of '{name}' is not allowed in the sandbox"),
                    vm.ctx.new_str(name),
                ));
            }
            original_import.call(args, vm)
        },
    );
    vm.builtins.set_attr("__import__", guard, vm)
}

fn block_builtin(vm: &VirtualMachine, name: &'static str, message: &'static str) -> PyResult<()> {
    let stub = vm.new_function(
        name,
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            Err(permission_error(vm, message.to_owned()))
        },
    );
    vm.builtins.set_attr(name, stub, vm)
}

/// Replaces builtin `name` with a native wrapper that runs `check` first.
fn wrap_builtin<F>(vm: &VirtualMachine, name: &'static str, check: F) -> PyResult<()>
where
    F: Fn(&FuncArgs, &VirtualMachine) -> PyResult<()> + 'static,
{
    let original = vm.builtins.get_attr(name, vm)?;
    let wrapper = vm.new_function(
        name,
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            check(&args, vm)?;
            original.call(args, vm)
        },
    );
    vm.builtins.set_attr(name, wrapper, vm)
}

fn reject_blocked_text(vm: &VirtualMachine, value: Option<&PyObjectRef>) -> PyResult<()> {
    let Some(value) = value else {
        return Ok(());
    };
    let text = value.str(vm)?;
    match find_blocked_name(text.as_str()) {
        Some(name) => Err(permission_error(vm, blocked_message(name))),
        None => Ok(()),
    }
}

fn check_attribute_name(args: &FuncArgs, vm: &VirtualMachine) -> PyResult<()> {
    reject_blocked_text(vm, args.args.get(1))
}

fn check_source_argument(args: &FuncArgs, vm: &VirtualMachine) -> PyResult<()> {
    reject_blocked_text(vm, args.args.first())
}

fn check_vars_argument(args: &FuncArgs, vm: &VirtualMachine) -> PyResult<()> {
    if args.args.is_empty() {
        Ok(())
    } else {
        Err(permission_error(vm, blocked_message("__dict__")))
    }
}

fn permission_error(vm: &VirtualMachine, message: String) -> PyBaseExceptionRef {
    vm.new_exception_msg(vm.ctx.exceptions.permission_error.to_owned(), message)
}

fn blocked_message(name: &str) -> String {
    format!("access to '{name}' is not allowed in the sandbox")
}

fn is_denied(module: &str, denied: &BTreeSet<String>) -> bool {
    module
        .split('.')
        .next()
        .is_some_and(|top| denied.contains(top))
}

/// First identifier in `source` that names a blocked attribute. String
/// literals count too, which catches `getattr(x, "__dict__")`.
fn find_blocked_name(source: &str) -> Option<&'static str> {
    source
        .split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .find_map(|word| BLOCKED_NAMES.iter().copied().find(|blocked| *blocked == word))
}

fn describe_exception(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    let class_name = format!("{}", exc.as_object().class().name());
    let message = exc
        .as_object()
        .str(vm)
        .map(|text| text.as_str().to_owned())
        .unwrap_or_default();
    if message.is_empty() {
        class_name
    } else {
        format!("{class_name}: {message}")
    }
}

fn is_module_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|ch: char| ch.is_ascii_digit())
        && name
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'))
}

fn validate_module_names(options: &EngineOptions) -> Result<(), EngineError> {
    let invalid = options
        .preload
        .iter()
        .chain(options.denied_modules.iter())
        .find(|name| !is_module_name(name));
    match invalid {
        Some(name) => Err(EngineError::Bootstrap(format!(
            "'{name}' is not a valid module name"
        ))),
        None => Ok(()),
    }
}

fn denied_modules(options: &EngineOptions) -> BTreeSet<String> {
    options
        .denied_modules
        .iter()
        .cloned()
        .chain(INTERPRETER_MODULES.iter().map(|name| (*name).to_string()))
        .collect()
}

fn sandbox_prelude(denied: &BTreeSet<String>) -> String {
    let denied = denied
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{SANDBOX_PRELUDE}\nDENIED = frozenset([{denied}])\n")
}
