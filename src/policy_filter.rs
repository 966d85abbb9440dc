// Policy filter with atomic program swap.
//
// A routing process holds one PolicyFilter per filter stage (import,
// source-match, export). Routes are filtered against an immutable snapshot
// of the compiled program and its sets; configuration changes build a new
// snapshot and swap it in.
//
// Design Principles:
// 1. Readers never wait on a rebuild - the lock is held only for the
//    pointer copy, writers queue on a separate mutex
// 2. Atomic swap - a run sees either the old snapshot or the new one
// 3. Monotonic versions - every swap gets the next version number
// 4. Fail closed - a filter error rejects the route and is logged
//
// Architecture:
// - CompiledFilter: program + sets + version, immutable
// - FilterHandle: shared reference to a snapshot, also carried by
//   Element::Filter
// - PolicyFilter: owns the current handle, an interpreter and statistics

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use crate::element::Element;
use crate::exec::{Evaluation, ExecConfig, ExecError, IvExec};
use crate::program::{Program, ProgramError};
use crate::set_manager::SetManager;
use crate::varrw::{FlowAction, VarRW};

/// Process-wide snapshot identity
static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Snapshots
// ============================================================================

/// Immutable compiled filter: one program with the sets it was bound to
#[derive(Debug)]
pub struct CompiledFilter {
    id: u64,
    version: u64,
    program: Arc<Program>,
    sets: Arc<SetManager>,
}

/// Shared handle to a compiled filter snapshot.
///
/// Handles compare by snapshot identity: two handles are equal only if they
/// refer to the same snapshot, and order by creation.
#[derive(Debug, Clone)]
pub struct FilterHandle(Arc<CompiledFilter>);

impl FilterHandle {
    pub fn new(version: u64, program: Arc<Program>, sets: Arc<SetManager>) -> Self {
        FilterHandle(Arc::new(CompiledFilter {
            id: NEXT_FILTER_ID.fetch_add(1, AtomicOrdering::Relaxed),
            version,
            program,
            sets,
        }))
    }

    pub fn version(&self) -> u64 {
        self.0.version
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.0.program
    }

    pub fn sets(&self) -> &Arc<SetManager> {
        &self.0.sets
    }

    /// Independent interpreter over this snapshot
    pub fn executor(&self, config: ExecConfig) -> IvExec {
        IvExec::with_config(self.0.program.clone(), self.0.sets.clone(), config)
    }
}

impl PartialEq for FilterHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for FilterHandle {}

impl PartialOrd for FilterHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FilterHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl Hash for FilterHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

// ============================================================================
// Configuration and statistics
// ============================================================================

/// Policy filter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Limits of the filter's interpreter
    pub exec: ExecConfig,
    /// Check stack depth of every program before installing it
    pub validate: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exec: ExecConfig::default(),
            validate: true,
        }
    }
}

/// Evaluation statistics of one filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    pub evaluations: u64,
    pub accepts: u64,
    pub rejects: u64,
    pub defaults: u64,
    pub errors: u64,
    /// Total eval time in microseconds
    pub total_eval_time_us: u64,
}

impl FilterStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an evaluation
    pub fn record_evaluation(&mut self, result: &Result<Evaluation, ExecError>, eval_time_us: u64) {
        self.evaluations += 1;
        self.total_eval_time_us += eval_time_us;
        match result {
            Ok(eval) => match eval.action {
                FlowAction::Accept => self.accepts += 1,
                FlowAction::Reject => self.rejects += 1,
                FlowAction::Default => self.defaults += 1,
            },
            Err(_) => self.errors += 1,
        }
    }

    /// Get average evaluation time
    pub fn avg_eval_time_us(&self) -> u64 {
        if self.evaluations == 0 {
            0
        } else {
            self.total_eval_time_us / self.evaluations
        }
    }
}

// ============================================================================
// Policy filter
// ============================================================================

/// A configurable filter stage
pub struct PolicyFilter {
    current: RwLock<FilterHandle>,
    writer: Mutex<()>,
    exec: Mutex<IvExec>,
    config: FilterConfig,
    stats: Mutex<FilterStats>,
}

impl Default for PolicyFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyFilter {
    /// Creates a filter with the empty program: every route gets Default
    pub fn new() -> Self {
        Self::with_config(FilterConfig::default())
    }

    pub fn with_config(config: FilterConfig) -> Self {
        let handle = FilterHandle::new(0, Arc::new(Program::new()), Arc::new(SetManager::new()));
        let exec = handle.executor(config.exec);
        Self {
            current: RwLock::new(handle),
            writer: Mutex::new(()),
            exec: Mutex::new(exec),
            config,
            stats: Mutex::new(FilterStats::new()),
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Current snapshot
    pub fn handle(&self) -> FilterHandle {
        self.current.read().clone()
    }

    /// Current snapshot wrapped as an element
    pub fn as_element(&self) -> Element {
        Element::Filter(self.handle())
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    /// Installs a new program, keeping the current sets.
    ///
    /// Returns the version of the new snapshot. Runs already in progress
    /// finish on the snapshot they started with.
    pub fn configure(&self, program: Program) -> Result<u64, ProgramError> {
        if self.config.validate {
            program.validate(self.config.exec.max_stack)?;
        }
        let referenced: Vec<String> = program
            .referenced_sets()
            .into_iter()
            .map(str::to_string)
            .collect();
        let count = program.instruction_count();
        let program = Arc::new(program);

        let version = self.swap(|current| {
            for name in &referenced {
                if !current.sets().contains(name) {
                    warn!("Program refers to set '{}' which is not defined yet", name);
                }
            }
            (program, current.sets().clone())
        });
        info!(
            "Configured policy filter version {} ({} instructions)",
            version, count
        );
        Ok(version)
    }

    /// Installs the empty program
    pub fn reset(&self) -> u64 {
        let empty = Arc::new(Program::new());
        let version = self.swap(|current| (empty, current.sets().clone()));
        info!("Reset policy filter, version {}", version);
        version
    }

    /// Registers or replaces one set (copy-on-write)
    pub fn update_set(&self, name: impl Into<String>, value: Element) -> u64 {
        let name = name.into();
        let version = self.swap(|current| {
            let mut sets = (**current.sets()).clone();
            sets.update(name.clone(), value);
            (current.program().clone(), Arc::new(sets))
        });
        info!("Updated set '{}', policy filter version {}", name, version);
        version
    }

    /// Replaces the whole set table
    pub fn replace_sets(&self, sets: SetManager) -> u64 {
        let sets = Arc::new(sets);
        let version = self.swap(|current| (current.program().clone(), sets));
        info!("Replaced sets, policy filter version {}", version);
        version
    }

    /// Builds the next snapshot from the current one and installs it.
    ///
    /// Writers are serialized by `writer`, so no update is built from a stale
    /// snapshot. Readers only contend with the final pointer copy.
    fn swap<F>(&self, build: F) -> u64
    where
        F: FnOnce(&FilterHandle) -> (Arc<Program>, Arc<SetManager>),
    {
        let _writer = self.writer.lock();
        let current = self.handle();
        let (program, sets) = build(&current);
        let next = FilterHandle::new(current.version() + 1, program, sets);
        let version = next.version();
        *self.current.write() = next;
        version
    }

    /// Builds an independent interpreter over the current snapshot
    pub fn executor(&self) -> IvExec {
        self.handle().executor(self.config.exec)
    }

    /// Runs the current snapshot against one route
    pub fn evaluate<V: VarRW + ?Sized>(
        &self,
        varrw: &mut V,
        trace: bool,
    ) -> Result<Evaluation, ExecError> {
        let handle = self.handle();
        let start = Instant::now();
        let result = {
            let mut exec = self.exec.lock();
            exec.set_program(handle.program().clone());
            exec.set_sets(handle.sets().clone());
            exec.evaluate(varrw, trace)
        };
        let elapsed = start.elapsed().as_micros() as u64;
        self.stats.lock().record_evaluation(&result, elapsed);
        result
    }

    /// Returns true if the route may pass.
    ///
    /// Accept and Default pass, Reject does not. Errors reject the route.
    pub fn accept_route<V: VarRW + ?Sized>(&self, varrw: &mut V) -> bool {
        self.filter_route(varrw).0
    }

    /// Like `accept_route`, also returning the execution trace when the
    /// program stored a non-zero level into TRACE.
    ///
    /// A requested trace is logged at info level together with the outcome.
    pub fn filter_route<V: VarRW + ?Sized>(&self, varrw: &mut V) -> (bool, Option<String>) {
        match self.evaluate(varrw, true) {
            Ok(eval) => {
                let pass = eval.action != FlowAction::Reject;
                if eval.trace_level == 0 {
                    return (pass, None);
                }
                let trace = eval.trace.unwrap_or_default();
                info!(
                    "Policy filter trace (level {}), outcome {}:\n{}",
                    eval.trace_level, eval.action, trace
                );
                (pass, Some(trace))
            }
            Err(e) => {
                error!("Policy filter error ({:?}), rejecting route: {}", e.kind(), e);
                (false, None)
            }
        }
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> FilterStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = FilterStats::new();
    }
}
