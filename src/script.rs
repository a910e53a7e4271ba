//! User script loading and static checking.
//!
//! `load_script` ingests a file: normalise the path (bare filenames resolve
//! against the session's scripts directory), compile it, enumerate the
//! top-level functions it defines, run the static checker, and only then
//! evaluate the file into the interactive scope. A script that fails any of
//! those steps contributes nothing to the scope.
//!
//! The static checker guards against the classic slip of typing a verb
//! without its brackets (`end` on a line by itself parses fine and does
//! nothing). Each line is stripped of string literals and comments, then
//! scanned for known verb names at word boundaries; the character
//! immediately following must be `(`.

use regex::Regex;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::backend::{BeginOptions, WaitSpec};
use crate::error::{CtlError, CtlResult};
use crate::session::{CsetRequest, Session, VERBS};
use crate::transport::PvValue;

/// Operation ceiling for one script evaluation; waits do not count.
const MAX_SCRIPT_OPS: u64 = 10_000_000;

// =============================================================================
// Static checker
// =============================================================================

pub struct ScriptChecker {
    pattern: Regex,
}

impl ScriptChecker {
    /// Build a checker over the exported verb vocabulary.
    pub fn new(verbs: &[&str]) -> Self {
        // Longest-first so `update_store` is not shadowed by `update`.
        let mut sorted: Vec<&str> = verbs.to_vec();
        sorted.sort_by_key(|v| std::cmp::Reverse(v.len()));
        let alternation = sorted.join("|");
        #[allow(clippy::expect_used)]
        let pattern = Regex::new(&format!(r"\b(?:{})\b", alternation))
            .expect("verb names form a valid pattern");
        Self { pattern }
    }

    /// Scan a script; one violation string per bracket-less verb use.
    pub fn check(&self, source: &str) -> Vec<String> {
        let mut violations = Vec::new();
        for (index, line) in source.lines().enumerate() {
            let cleaned = strip_strings_and_comments(line);
            for found in self.pattern.find_iter(&cleaned) {
                let next = cleaned[found.end()..].chars().next();
                if next != Some('(') {
                    violations.push(format!(
                        "Line {}: '{}' command without brackets",
                        index + 1,
                        found.as_str()
                    ));
                }
            }
        }
        violations
    }

    /// Soft warnings: script functions that shadow a verb.
    pub fn shadow_warnings(&self, functions: &[String]) -> Vec<String> {
        functions
            .iter()
            .filter(|name| VERBS.contains(&name.as_str()))
            .map(|name| format!("Script function '{}' shadows a command", name))
            .collect()
    }
}

/// Blank out string literals and cut comments so the checker never matches
/// inside either.
fn strip_strings_and_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' {
                    // Escaped character stays inside the literal.
                    out.push(' ');
                    if chars.next().is_some() {
                        out.push(' ');
                    }
                } else if c == q {
                    quote = None;
                    out.push(' ');
                } else {
                    out.push(' ');
                }
            }
            None => match c {
                '"' | '`' | '\'' => {
                    quote = Some(c);
                    out.push(' ');
                }
                '/' if chars.peek() == Some(&'/') => break,
                _ => out.push(c),
            },
        }
    }
    out
}

// =============================================================================
// Path normalisation
// =============================================================================

/// Normalise a user-supplied script path: backslashes become slashes,
/// duplicate separators collapse, and bare filenames resolve against the
/// scripts directory.
pub fn normalise_path(raw: &str, scripts_dir: &Path) -> PathBuf {
    let forward = raw.trim().replace('\\', "/");
    let mut collapsed = String::with_capacity(forward.len());
    let mut last_slash = false;
    for c in forward.chars() {
        if c == '/' {
            if !last_slash {
                collapsed.push(c);
            }
            last_slash = true;
        } else {
            collapsed.push(c);
            last_slash = false;
        }
    }
    if collapsed.contains('/') {
        PathBuf::from(collapsed)
    } else {
        scripts_dir.join(collapsed)
    }
}

// =============================================================================
// Script host
// =============================================================================

/// Owns the embedded engine and the persistent interactive scope; verbs are
/// registered as script functions bridging onto the async session.
///
/// The bridge blocks in place on the session's runtime, so the host must
/// live on a multi-threaded runtime.
pub struct ScriptHost {
    engine: Engine,
    scope: Scope<'static>,
    /// Functions from every successfully loaded script, so they stay
    /// callable interactively after the load.
    library: AST,
    session: Arc<Session>,
    checker: ScriptChecker,
}

impl ScriptHost {
    pub fn new(session: Arc<Session>, runtime: Handle) -> Self {
        let mut engine = Engine::new();
        engine.on_progress(|count| {
            if count > MAX_SCRIPT_OPS {
                Some(format!("Safety limit exceeded: maximum {} operations", MAX_SCRIPT_OPS).into())
            } else {
                None
            }
        });
        register_verbs(&mut engine, session.clone(), runtime);
        Self {
            engine,
            scope: Scope::new(),
            library: AST::empty(),
            session,
            checker: ScriptChecker::new(VERBS),
        }
    }

    pub fn checker(&self) -> &ScriptChecker {
        &self.checker
    }

    /// Load a user script into the interactive scope; returns the names of
    /// the functions it defines.
    pub fn load_script(&mut self, raw_path: &str, warnings_as_error: bool) -> CtlResult<Vec<String>> {
        let path = normalise_path(raw_path, &self.session.scripts_dir());
        let source =
            std::fs::read_to_string(&path).map_err(|_| CtlError::ScriptMissing(path.clone()))?;

        let ast = self
            .engine
            .compile(&source)
            .map_err(|e| CtlError::ScriptParse(e.to_string()))?;
        let functions: Vec<String> = ast
            .iter_functions()
            .map(|f| f.name.to_string())
            .collect();

        let violations = self.checker.check(&source);
        if !violations.is_empty() {
            for violation in &violations {
                println!("{}", violation);
            }
            return Err(CtlError::ScriptCheck(violations));
        }
        let warnings = self.checker.shadow_warnings(&functions);
        if !warnings.is_empty() {
            if warnings_as_error {
                return Err(CtlError::ScriptCheck(warnings));
            }
            for warning in &warnings {
                println!("Warning: {}", warning);
            }
        }

        // Functions loaded earlier stay visible to the new script.
        let merged = self.library.merge(&ast);
        self.engine
            .run_ast_with_scope(&mut self.scope, &merged)
            .map_err(|e| CtlError::ScriptParse(e.to_string()))?;
        self.library = self.library.merge(&ast.clone_functions_only());

        if !functions.is_empty() {
            println!("Loaded: {}", functions.join(", "));
        }
        Ok(functions)
    }

    /// Evaluate one interactive line in the persistent scope; functions
    /// from loaded scripts remain callable.
    pub fn run_line(&mut self, line: &str) -> CtlResult<Option<String>> {
        let line_ast = self
            .engine
            .compile(line)
            .map_err(|e| CtlError::ScriptParse(e.to_string()))?;
        let combined = self.library.merge(&line_ast);
        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut self.scope, &combined)
            .map_err(|e| CtlError::ScriptParse(e.to_string()))?;
        if result.is_unit() {
            Ok(None)
        } else {
            Ok(Some(result.to_string()))
        }
    }
}

// =============================================================================
// Verb bindings
// =============================================================================

fn run<T>(
    handle: &Handle,
    future: impl std::future::Future<Output = CtlResult<Option<T>>>,
) -> Result<Option<T>, Box<EvalAltResult>> {
    tokio::task::block_in_place(|| handle.block_on(future)).map_err(|e| e.to_string().into())
}

fn unit<T>(
    handle: &Handle,
    future: impl std::future::Future<Output = CtlResult<Option<T>>>,
) -> Result<(), Box<EvalAltResult>> {
    run(handle, future).map(|_| ())
}

fn to_dynamic(value: PvValue) -> Dynamic {
    match value {
        PvValue::Float(f) => Dynamic::from_float(f),
        PvValue::Int(i) => Dynamic::from_int(i),
        PvValue::Str(s) => s.into(),
        PvValue::FloatArray(v) => {
            Dynamic::from_array(v.into_iter().map(Dynamic::from_float).collect())
        }
        PvValue::IntArray(v) => Dynamic::from_array(v.into_iter().map(Dynamic::from_int).collect()),
    }
}

/// Register the verb vocabulary on the engine. Each binding is a sync shim
/// blocking on the async session verb.
#[allow(clippy::too_many_lines)]
fn register_verbs(engine: &mut Engine, session: Arc<Session>, handle: Handle) {
    // -- run transitions -----------------------------------------------------
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("begin", move || unit(&h, s.begin(BeginOptions::default())));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("begin", move |period: i64| {
            unit(
                &h,
                s.begin(BeginOptions {
                    period: Some(period),
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("end", move || unit(&h, s.end()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("pause", move || unit(&h, s.pause()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("resume", move || unit(&h, s.resume()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("abort", move || unit(&h, s.abort()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("recover", move || unit(&h, s.recover()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("update", move || unit(&h, s.update()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("store", move || unit(&h, s.store()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("update_store", move || unit(&h, s.update_store()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("snapshot_crpt", move |path: String| {
            unit(&h, s.snapshot_crpt(&path))
        });
    }

    // -- blocks --------------------------------------------------------------
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("cset", move |name: String, value: f64| {
            unit(
                &h,
                s.cset(CsetRequest {
                    pairs: vec![(name, value.into())],
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("cset", move |name: String, value: i64| {
            unit(
                &h,
                s.cset(CsetRequest {
                    pairs: vec![(name, value.into())],
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("cset", move |name: String, value: String| {
            unit(
                &h,
                s.cset(CsetRequest {
                    pairs: vec![(name, value.into())],
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn(
            "cset_wait",
            move |name: String, value: f64, low: f64, high: f64| {
                unit(
                    &h,
                    s.cset(CsetRequest {
                        pairs: vec![(name, value.into())],
                        low: Some(low),
                        high: Some(high),
                        wait: true,
                        ..Default::default()
                    }),
                )
            },
        );
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn(
            "cset_runcontrol",
            move |name: String, value: f64, low: f64, high: f64| {
                unit(
                    &h,
                    s.cset(CsetRequest {
                        pairs: vec![(name, value.into())],
                        runcontrol: Some(true),
                        low: Some(low),
                        high: Some(high),
                        ..Default::default()
                    }),
                )
            },
        );
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("cget", move |name: String| {
            run(&h, s.cget(&name)).map(|snapshot| match snapshot {
                Some(snapshot) => to_dynamic(snapshot.value),
                None => Dynamic::UNIT,
            })
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("cshow", move || unit(&h, s.cshow(None)));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("cshow", move |name: String| unit(&h, s.cshow(Some(&name))));
    }

    // -- waits ---------------------------------------------------------------
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("waitfor_seconds", move |seconds: f64| {
            unit(
                &h,
                s.waitfor(WaitSpec {
                    seconds: Some(seconds),
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("waitfor_seconds", move |seconds: i64| {
            unit(
                &h,
                s.waitfor(WaitSpec {
                    seconds: Some(seconds as f64),
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("waitfor_frames", move |frames: i64| {
            unit(
                &h,
                s.waitfor(WaitSpec {
                    frames: Some(frames),
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("waitfor_uamps", move |uamps: f64| {
            unit(
                &h,
                s.waitfor(WaitSpec {
                    uamps: Some(uamps),
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("waitfor", move |block: String, low: f64, high: f64| {
            unit(
                &h,
                s.waitfor(WaitSpec {
                    block: Some(block),
                    low: Some(low),
                    high: Some(high),
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("waitfor_time", move |clock: String| {
            unit(
                &h,
                s.waitfor(WaitSpec {
                    time: Some(clock),
                    ..Default::default()
                }),
            )
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("waitfor_runstate", move |state: String| {
            unit(&h, s.waitfor_runstate(&state, 3600.0, false))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("waitfor_runstate", move |state: String, maxwaitsecs: f64| {
            unit(&h, s.waitfor_runstate(&state, maxwaitsecs, false))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("waitfor_move", move || {
            unit(&h, s.waitfor_move(None, Duration::from_secs(2), None))
        });
    }

    // -- reconfiguration -----------------------------------------------------
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("change_start", move || unit(&h, s.change_start()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("change_finish", move || unit(&h, s.change_finish()));
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("change_monitor", move |spectrum: i64, low: f64, high: f64| {
            unit(&h, s.change_monitor(spectrum, low, high))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("change_sync", move |source: String| {
            unit(&h, s.change_sync(&source))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("change_tcb_file", move |file: String| {
            unit(&h, s.change_tcb_file(&file))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn(
            "change_tcb",
            move |low: f64, high: f64, step: f64, trange: i64, log: bool, regime: i64| {
                unit(
                    &h,
                    s.change_tcb(Some(low), Some(high), Some(step), trange, log, regime),
                )
            },
        );
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn(
            "change_tables",
            move |wiring: String, detector: String, spectra: String| {
                unit(
                    &h,
                    s.change_tables(
                        (!wiring.is_empty()).then_some(wiring.clone()),
                        (!detector.is_empty()).then_some(detector.clone()),
                        (!spectra.is_empty()).then_some(spectra.clone()),
                    ),
                )
            },
        );
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("set_num_soft_periods", move |count: i64| {
            unit(&h, s.set_num_soft_periods(count))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("set_period_mode", move |mode: String| {
            unit(&h, s.set_period_mode(&mode))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("set_fermi_veto", move |enable: bool, delay: f64, width: f64| {
            unit(&h, s.set_fermi_veto(enable, delay, width))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("change_title", move |title: String| {
            let mut opts = BTreeMap::new();
            opts.insert("title".to_string(), serde_json::json!(title));
            unit(&h, s.change(opts))
        });
    }

    // -- raw channel access ---------------------------------------------------
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("set_pv", move |name: String, value: f64| {
            unit(&h, s.set_pv(&name, value.into(), false, true))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("set_pv", move |name: String, value: i64| {
            unit(&h, s.set_pv(&name, value.into(), false, true))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("set_pv", move |name: String, value: String| {
            unit(&h, s.set_pv(&name, value.into(), false, true))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("get_pv", move |name: String| {
            run(&h, s.get_pv(&name, false)).map(|value| match value {
                Some(value) => to_dynamic(value),
                None => Dynamic::UNIT,
            })
        });
    }

    // -- misc ----------------------------------------------------------------
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("plot_spectrum", move |spectrum: i64| {
            unit(&h, s.plot_spectrum(spectrum, 1, true))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("plot_spectrum", move |spectrum: i64, period: i64| {
            unit(&h, s.plot_spectrum(spectrum, period, true))
        });
    }
    {
        let (s, h) = (session.clone(), handle.clone());
        engine.register_fn("set_instrument", move |name: String| {
            unit(&h, s.set_instrument(&name))
        });
    }
    {
        let (s, h) = (session, handle);
        engine.register_fn("change_script_dir", move |dir: String| {
            unit(&h, s.change_script_dir(&dir))
        });
    }
}
