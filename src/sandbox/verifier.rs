//! Dynamic identity verification
//!
//! Runs the entry point of a bundle in a fresh, capability-restricted Lua VM and
//! records the service names the SDK stub sees at runtime. The VM has no
//! `io`/`os`/`package`/`debug`/`coroutine` libraries and no code loading
//! primitives; `require` resolves only whitelisted stubs and the bundle's own
//! files. One VM per verification, dropped before the result is returned.

use crate::config::SandboxConfig;
use crate::error::ValidationError;
use crate::manifest::Artifact;
use crate::sandbox::modules::{has_stub, RESTATE_STUB, WORKFLOW_SDK_STUB};
use crate::token::ExpectedIdentity;
use mlua::{Function, HookTriggers, IntoLuaMulti, Lua, LuaOptions, MultiValue, StdLib, Table, Value, Variadic, VmState};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Registry key of the per-VM module cache
const LOADED_KEY: &str = "deploy_gate.loaded";

/// Deadline check granularity in VM instructions
const HOOK_INTERVAL: u32 = 1_000;

/// Extra time the blocking thread gets to unwind after the VM deadline
const EXIT_GRACE: Duration = Duration::from_millis(250);

/// Captured `print` lines kept per run
const MAX_OUTPUT_LINES: usize = 100;

/// Worst-case matcher steps a single pattern call may cost
///
/// Pattern matching runs inside C, where the instruction hook never fires, so
/// an expensive call has to be refused before it starts.
const PATTERN_STEP_BUDGET: f64 = 1e8;

/// Replaces the pattern functions of `string` with guarded versions.
/// Chunk argument: the guard, called as `guard(subject, pattern)`.
const PATTERN_GUARD: &str = r#"
local guard = ...
local find, match, gmatch, gsub = string.find, string.match, string.gmatch, string.gsub
string.find = function(s, p, init, plain)
  if not plain then guard(s, p) end
  return find(s, p, init, plain)
end
string.match = function(s, p, init)
  guard(s, p)
  return match(s, p, init)
end
string.gmatch = function(s, p, init)
  guard(s, p)
  return gmatch(s, p, init)
end
string.gsub = function(s, p, repl, n)
  guard(s, p)
  return gsub(s, p, repl, n)
end
"#;

/// What a sandbox run observed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxReport {
    /// Service names passed to SDK registration calls at runtime
    pub names: BTreeSet<String>,
    /// Lines written with `print`
    pub output: Vec<String>,
    pub elapsed_ms: u64,
}

/// Shared between the VM callbacks and the classifier
#[derive(Debug, Default)]
struct RunState {
    timed_out: AtomicBool,
    denied: Mutex<Vec<String>>,
    names: Mutex<Vec<String>>,
    output: Mutex<Vec<String>>,
}

impl RunState {
    fn first_denied(&self) -> Option<String> {
        self.denied.lock().ok().and_then(|denied| denied.first().cloned())
    }

    /// Failures that a script-level `pcall` must not be able to swallow
    fn must_propagate(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst) || self.first_denied().is_some()
    }
}

/// Limits captured for one run
#[derive(Debug, Clone)]
struct VmLimits {
    timeout: Duration,
    memory_limit_bytes: usize,
    allowed_modules: Vec<String>,
    sdk_version: String,
}

/// Pool-limited executor of single-use sandboxes
pub struct SandboxVerifier {
    config: SandboxConfig,
    permits: Arc<Semaphore>,
}

impl SandboxVerifier {
    /// Create a verifier that runs at most `max_concurrent` VMs at once
    pub fn new(config: SandboxConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { config, permits }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Execute the bundle the way `expected` describes it and report declared services
    pub async fn execute(
        &self,
        artifact: &Artifact,
        timeout: Duration,
        expected: &ExpectedIdentity,
    ) -> Result<SandboxReport, ValidationError> {
        if !version_satisfies(&self.config.sdk_version, &expected.min_sdk_version) {
            return Err(ValidationError::SandboxExecutionError(format!(
                "artifact requires SDK >= {}, sandbox provides {}",
                expected.min_sdk_version, self.config.sdk_version
            )));
        }

        self.run(artifact, &expected.entry_point, &expected.handler_export, timeout)
            .await
    }

    /// Run `entry_point` and check that it exports `handler_export`
    pub async fn run(
        &self,
        artifact: &Artifact,
        entry_point: &str,
        handler_export: &str,
        timeout: Duration,
    ) -> Result<SandboxReport, ValidationError> {
        // A run still unwinding keeps its slot; waiting for one is bounded too
        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ValidationError::SandboxExecutionError(
                    "sandbox pool is closed".into(),
                ))
            }
            Err(_) => {
                tracing::warn!("⏳ No sandbox slot became free within {:?}", timeout);
                return Err(ValidationError::SandboxTimeout(duration_ms(timeout)));
            }
        };

        let limits = VmLimits {
            timeout,
            memory_limit_bytes: self.config.memory_limit_bytes,
            allowed_modules: self.config.allowed_modules.clone(),
            sdk_version: self.config.sdk_version.clone(),
        };
        let artifact = Arc::new(artifact.clone());
        let entry_point = entry_point.to_string();
        let handler_export = handler_export.to_string();

        tracing::info!("🧪 Sandbox run: entry={} timeout={:?}", entry_point, timeout);

        let handle = tokio::task::spawn_blocking(move || {
            // Held until the thread finishes, even if the caller stopped waiting
            let _permit = permit;
            run_isolated(artifact, &entry_point, &handler_export, &limits)
        });

        let result = match tokio::time::timeout(timeout + EXIT_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ValidationError::SandboxExecutionError(format!(
                "sandbox thread failed: {}",
                e
            ))),
            Err(_) => Err(ValidationError::SandboxTimeout(duration_ms(timeout))),
        };

        match &result {
            Ok(report) => tracing::info!(
                "✅ Sandbox run finished in {} ms, services={:?}",
                report.elapsed_ms,
                report.names
            ),
            Err(e) => tracing::warn!("❌ Sandbox run rejected: {}", e),
        }

        result
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Build, run and tear down one VM on the current (blocking) thread
fn run_isolated(
    artifact: Arc<Artifact>,
    entry_point: &str,
    handler_export: &str,
    limits: &VmLimits,
) -> Result<SandboxReport, ValidationError> {
    let started = Instant::now();
    let state = Arc::new(RunState::default());

    let source = artifact.source(entry_point).map(str::to_string).ok_or_else(|| {
        ValidationError::SandboxExecutionError(format!(
            "entry point '{}' is not part of the bundle",
            entry_point
        ))
    })?;

    let outcome = build_vm(Arc::clone(&artifact), limits, Arc::clone(&state)).and_then(|lua| {
        let exports = lua
            .load(source.as_str())
            .set_name(format!("@{}", entry_point))
            .call::<Value>(())?;
        let handler = match &exports {
            Value::Table(table) => table.get::<Value>(handler_export)?,
            _ => Value::Nil,
        };
        // `lua` is dropped here together with everything it allocated
        Ok(!handler.is_nil())
    });

    if state.timed_out.load(Ordering::SeqCst) {
        return Err(ValidationError::SandboxTimeout(duration_ms(limits.timeout)));
    }
    if let Some(module) = state.first_denied() {
        return Err(ValidationError::UnauthorizedImport(module));
    }

    match outcome {
        Ok(true) => {}
        Ok(false) => {
            return Err(ValidationError::SandboxExecutionError(format!(
                "entry point '{}' does not export '{}'",
                entry_point, handler_export
            )))
        }
        Err(e) if is_memory_error(&e) => {
            return Err(ValidationError::SandboxExecutionError(format!(
                "memory limit of {} bytes exceeded",
                limits.memory_limit_bytes
            )))
        }
        Err(e) => return Err(ValidationError::SandboxExecutionError(first_line(&e))),
    }

    let names = state
        .names
        .lock()
        .map(|names| names.iter().cloned().collect())
        .unwrap_or_default();
    let output = state
        .output
        .lock()
        .map(|output| output.clone())
        .unwrap_or_default();

    Ok(SandboxReport {
        names,
        output,
        elapsed_ms: duration_ms(started.elapsed()),
    })
}

fn first_line(err: &mlua::Error) -> String {
    err.to_string()
        .lines()
        .next()
        .unwrap_or("uncaught error")
        .to_string()
}

fn is_memory_error(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

fn build_vm(artifact: Arc<Artifact>, limits: &VmLimits, state: Arc<RunState>) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    lua.set_memory_limit(limits.memory_limit_bytes)?;

    let globals = lua.globals();
    for name in [
        "dofile",
        "loadfile",
        "load",
        "loadstring",
        "collectgarbage",
        "xpcall",
        "os",
        "io",
        "debug",
        "package",
        "coroutine",
    ] {
        globals.set(name, mlua::Nil)?;
    }

    lua.set_named_registry_value(LOADED_KEY, lua.create_table()?)?;

    let output_state = Arc::clone(&state);
    let print = lua.create_function(move |_, args: Variadic<Value>| {
        let line = args.iter().map(display_value).collect::<Vec<_>>().join("\t");
        if let Ok(mut output) = output_state.output.lock() {
            if output.len() < MAX_OUTPUT_LINES {
                output.push(line);
            }
        }
        Ok(())
    })?;
    globals.set("print", print)?;

    let pcall_state = Arc::clone(&state);
    let pcall = lua.create_function(move |lua, (f, args): (Function, MultiValue)| {
        match f.call::<MultiValue>(args) {
            Ok(values) => (true, values).into_lua_multi(lua),
            Err(err) if pcall_state.must_propagate() || is_memory_error(&err) => Err(err),
            Err(err) => (false, first_line(&err)).into_lua_multi(lua),
        }
    })?;
    globals.set("pcall", pcall)?;

    let require = create_require(&lua, artifact, limits, Arc::clone(&state))?;
    globals.set("require", require)?;

    lua.load(PATTERN_GUARD)
        .set_name("=pattern-guard")
        .call::<()>(create_pattern_guard(&lua)?)?;

    let deadline = Instant::now() + limits.timeout;
    let hook_state = Arc::clone(&state);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                hook_state.timed_out.store(true, Ordering::SeqCst);
                return Err(mlua::Error::runtime("sandbox deadline exceeded"));
            }
            Ok(VmState::Continue)
        },
    )?;

    Ok(lua)
}

fn create_pattern_guard(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|_, (subject, pattern): (Value, Value)| {
        let (Some(subject), Some(pattern)) = (lua_bytes(&subject), lua_bytes(&pattern)) else {
            // Let the stock function raise its own argument error
            return Ok(());
        };
        if pattern_cost(subject.len(), &pattern) > PATTERN_STEP_BUDGET {
            return Err(mlua::Error::runtime(format!(
                "pattern '{}' is too expensive for a {}-byte subject",
                String::from_utf8_lossy(&pattern),
                subject.len()
            )));
        }
        Ok(())
    })
}

fn lua_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Integer(i) => Some(i.to_string().into_bytes()),
        Value::Number(n) => Some(n.to_string().into_bytes()),
        _ => None,
    }
}

/// Upper bound on the steps a Lua pattern can take over `subject_len` bytes
///
/// Every repetition (`*`, `+`, `-`) can backtrack over the whole subject and
/// every `?` doubles the alternatives; the unanchored scan adds one more factor.
fn pattern_cost(subject_len: usize, pattern: &[u8]) -> f64 {
    let mut repeats = 0i32;
    let mut optional = 0i32;
    let mut after_item = false;
    let mut i = 0;

    while i < pattern.len() {
        match pattern[i] {
            b'%' => {
                match pattern.get(i + 1) {
                    Some(b'b') => {
                        i += 4;
                        after_item = false;
                    }
                    Some(b'f') => {
                        i = skip_set(pattern, i + 2);
                        after_item = false;
                    }
                    _ => {
                        i += 2;
                        after_item = true;
                    }
                }
                continue;
            }
            b'[' => {
                i = skip_set(pattern, i);
                after_item = true;
                continue;
            }
            b'*' | b'+' | b'-' if after_item => {
                repeats += 1;
                after_item = false;
            }
            b'?' if after_item => {
                optional += 1;
                after_item = false;
            }
            _ => after_item = true,
        }
        i += 1;
    }

    let positions = subject_len as f64 + 1.0;
    positions.powi(repeats + 1) * 2f64.powi(optional)
}

/// Index just past the `[...]` set opening at `open`
fn skip_set(pattern: &[u8], open: usize) -> usize {
    let mut i = open + 1;
    if pattern.get(i) == Some(&b'^') {
        i += 1;
    }
    // A leading `]` is a literal member
    if pattern.get(i) == Some(&b']') {
        i += 1;
    }
    while i < pattern.len() {
        match pattern[i] {
            b'%' => i += 2,
            b']' => return i + 1,
            _ => i += 1,
        }
    }
    pattern.len()
}

fn create_require(
    lua: &Lua,
    artifact: Arc<Artifact>,
    limits: &VmLimits,
    state: Arc<RunState>,
) -> mlua::Result<Function> {
    let allowed = limits.allowed_modules.clone();
    let version = limits.sdk_version.clone();

    lua.create_function(move |lua, module: String| {
        let loaded: Table = lua.named_registry_value(LOADED_KEY)?;
        let cached: Value = loaded.get(module.as_str())?;
        if !cached.is_nil() {
            return Ok(cached);
        }

        let value = if allowed.iter().any(|m| m == &module) && has_stub(&module) {
            load_stub(lua, &module, &version, &state)?
        } else if let Some(path) = artifact.module_path(&module) {
            let source = artifact.source(&path).unwrap_or_default();
            lua.load(source)
                .set_name(format!("@{}", path))
                .call::<Value>(module.clone())?
        } else {
            if let Ok(mut denied) = state.denied.lock() {
                denied.push(module.clone());
            }
            return Err(mlua::Error::runtime(format!(
                "module '{}' is not on the sandbox whitelist",
                module
            )));
        };

        // Modules returning nothing are cached as `true`, like stock `require`
        let value = if value.is_nil() { Value::Boolean(true) } else { value };
        loaded.set(module.as_str(), value.clone())?;
        Ok(value)
    })
}

fn load_stub(lua: &Lua, module: &str, version: &str, state: &Arc<RunState>) -> mlua::Result<Value> {
    match module {
        "restate" => {
            let names_state = Arc::clone(state);
            let record = lua.create_function(move |_, (_kind, name): (String, String)| {
                names_state
                    .names
                    .lock()
                    .map_err(|_| mlua::Error::runtime("service recorder is unavailable"))?
                    .push(name);
                Ok(())
            })?;
            lua.load(RESTATE_STUB)
                .set_name("=restate")
                .call::<Value>((record, version.to_string()))
        }
        "workflow-sdk" => lua
            .load(WORKFLOW_SDK_STUB)
            .set_name("=workflow-sdk")
            .call::<Value>(version.to_string()),
        other => Err(mlua::Error::runtime(format!("no stub for module '{}'", other))),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}

/// Whether a dotted `provided` version is at least `minimum` (empty minimum always holds)
pub fn version_satisfies(provided: &str, minimum: &str) -> bool {
    fn parts(version: &str) -> Vec<u64> {
        version
            .trim()
            .trim_start_matches('v')
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }

    if minimum.trim().is_empty() {
        return true;
    }

    let (provided, minimum) = (parts(provided), parts(minimum));
    let width = provided.len().max(minimum.len());
    for i in 0..width {
        let p = provided.get(i).copied().unwrap_or(0);
        let m = minimum.get(i).copied().unwrap_or(0);
        if p != m {
            return p > m;
        }
    }
    true
}
