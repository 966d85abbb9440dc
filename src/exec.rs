// Stack-based policy interpreter.
//
// IvExec runs a compiled Program against one route, seen through a VarRW,
// and returns Accept, Reject or Default.
//
// Design Principles:
// 1. Policy -> term -> instruction, first decision wins at every level
// 2. Stack slots borrow - literals point into the program snapshot, sets into
//    the set provider, operator results into the trash arena
// 3. Clean exit on every path - the stack lives for one run, the trash is
//    drained at the end of every run, successful or not
// 4. Commit only on success - sync() after a decision, discard() after an
//    error, never both
//
// Architecture:
// - IvExec: owns the program/set snapshot, the trash and the dispatcher
// - Run: the state of one run (stack, trace sink, trace level)
// - evaluate(): one-shot entry point returning an Evaluation

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

use crate::element::Element;
use crate::operator::{Dispatcher, OperatorError};
use crate::program::{Instruction, Policy, Program, Term};
use crate::set_manager::{SetManager, SetProvider};
use crate::varrw::{FlowAction, VarId, VarRW};

/// Set provider shared between interpreters
pub type SharedSets = Arc<dyn SetProvider + Send + Sync>;

// ============================================================================
// Errors
// ============================================================================

/// Broad class of an execution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Program refers to something the environment does not provide
    Bind,
    /// Operand types do not fit the operation
    Type,
    /// Malformed program or exhausted interpreter resources
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("Unknown set: {0}")]
    UnknownSet(String),

    #[error("Set '{name}' holds a {found}, not a set")]
    NotASet { name: String, found: &'static str },

    #[error("Stack underflow at {0}")]
    StackUnderflow(String),

    #[error("Stack overflow: limit {limit}")]
    StackOverflow { limit: usize },

    #[error("Trash overflow: limit {limit}")]
    TrashOverflow { limit: usize },

    #[error("ONFALSE_EXIT expects bool on top of stack, found {found}")]
    ExpectedBool { found: &'static str },

    #[error("Trace level must be u32, found {found}")]
    TraceType { found: &'static str },

    #[error("Operator error: {0}")]
    Type(#[from] OperatorError),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::UnknownSet(_) | ExecError::NotASet { .. } => ErrorKind::Bind,
            ExecError::ExpectedBool { .. } | ExecError::TraceType { .. } | ExecError::Type(_) => {
                ErrorKind::Type
            }
            ExecError::StackUnderflow(_)
            | ExecError::StackOverflow { .. }
            | ExecError::TrashOverflow { .. } => ErrorKind::Internal,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Interpreter limits, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Deepest stack a term may build
    pub max_stack: usize,
    /// Operator results one run may produce
    pub max_trash: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_stack: 128,
            max_trash: 2000,
        }
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub action: FlowAction,
    /// Execution trace, when requested and allowed by the route
    pub trace: Option<String>,
    /// Level stored into the TRACE metavariable by the program
    pub trace_level: u32,
}

// ============================================================================
// Interpreter
// ============================================================================

/// Policy interpreter.
///
/// Not re-entrant: one instance runs one route at a time. Filter routes
/// concurrently with one instance per thread over the same `Arc<Program>`.
pub struct IvExec {
    program: Arc<Program>,
    sets: SharedSets,
    config: ExecConfig,
    trash: Vec<Element>,
    dispatcher: Dispatcher,
    trace_level: u32,
    traced: bool,
    failed_trace: Option<String>,
}

impl Default for IvExec {
    fn default() -> Self {
        Self::new(Arc::new(Program::new()), Arc::new(SetManager::new()))
    }
}

impl IvExec {
    pub fn new(program: Arc<Program>, sets: SharedSets) -> Self {
        Self::with_config(program, sets, ExecConfig::default())
    }

    pub fn with_config(program: Arc<Program>, sets: SharedSets, config: ExecConfig) -> Self {
        Self {
            program,
            sets,
            config,
            trash: Vec::new(),
            dispatcher: Dispatcher::new(),
            trace_level: 0,
            traced: false,
            failed_trace: None,
        }
    }

    /// Replaces the program used by the next run
    pub fn set_program(&mut self, program: Arc<Program>) {
        self.program = program;
    }

    /// Replaces the set provider used by the next run
    pub fn set_sets(&mut self, sets: SharedSets) {
        self.sets = sets;
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Temporaries currently held. Zero between runs.
    pub fn trash_len(&self) -> usize {
        self.trash.len()
    }

    /// Trace level set by the last run
    pub fn last_trace_level(&self) -> u32 {
        self.trace_level
    }

    /// Partial trace of the last `evaluate` call, if it failed while tracing
    pub fn failed_trace(&self) -> Option<&str> {
        self.failed_trace.as_deref()
    }

    /// Runs the program against one route.
    ///
    /// When `trace` is given and the route allows it, one line per executed
    /// instruction is appended to it.
    pub fn run<V: VarRW + ?Sized>(
        &mut self,
        varrw: &mut V,
        trace: Option<&mut String>,
    ) -> Result<FlowAction, ExecError> {
        let program = Arc::clone(&self.program);
        let sets = Arc::clone(&self.sets);
        let trace = trace.filter(|_| varrw.trace_allowed());
        self.traced = trace.is_some();

        let (outcome, trace_level) = {
            let mut run = Run {
                varrw: &mut *varrw,
                sets: &*sets,
                trash: &mut self.trash,
                dispatcher: &mut self.dispatcher,
                config: self.config,
                trace,
                trace_level: 0,
                stack: Vec::with_capacity(self.config.max_stack.min(16)),
            };
            let outcome = run.program(&program);
            (outcome, run.trace_level)
        };
        self.trace_level = trace_level;

        match &outcome {
            Ok(action) => {
                debug!("Filter outcome: {}", action);
                varrw.sync();
            }
            Err(e) => {
                debug!("Filter run aborted: {}", e);
                varrw.discard();
            }
        }
        self.trash.clear();
        outcome
    }

    /// Runs the program and packages the outcome with its trace
    pub fn evaluate<V: VarRW + ?Sized>(
        &mut self,
        varrw: &mut V,
        trace: bool,
    ) -> Result<Evaluation, ExecError> {
        self.failed_trace = None;
        let mut buf = String::new();
        let sink = if trace { Some(&mut buf) } else { None };
        let action = match self.run(varrw, sink) {
            Ok(action) => action,
            Err(e) => {
                if self.traced {
                    debug!("Trace of failed run:\n{}", buf);
                    self.failed_trace = Some(buf);
                }
                return Err(e);
            }
        };
        Ok(Evaluation {
            action,
            trace: if self.traced { Some(buf) } else { None },
            trace_level: self.trace_level,
        })
    }
}

/// Evaluates `program` once against one route
pub fn evaluate<V: VarRW + ?Sized>(
    program: Arc<Program>,
    sets: SharedSets,
    varrw: &mut V,
    trace: bool,
) -> Result<Evaluation, ExecError> {
    IvExec::new(program, sets).evaluate(varrw, trace)
}

// ============================================================================
// One run
// ============================================================================

/// Stack slot. Never owns an operator result; those live in the trash.
enum Slot<'p> {
    Borrowed(&'p Element),
    Loaded(Element),
    Temp(usize),
}

fn resolve<'s>(slot: &'s Slot<'_>, trash: &'s [Element]) -> &'s Element {
    match slot {
        Slot::Borrowed(e) => e,
        Slot::Loaded(e) => e,
        Slot::Temp(i) => &trash[*i],
    }
}

enum Step {
    Continue,
    Finish(FlowAction),
}

macro_rules! trace_line {
    ($run:expr, $($arg:tt)*) => {
        if let Some(out) = $run.trace.as_mut() {
            let _ = writeln!(out, $($arg)*);
        }
    };
}

struct Run<'r, 'p, V: ?Sized> {
    varrw: &'r mut V,
    sets: &'p dyn SetProvider,
    trash: &'r mut Vec<Element>,
    dispatcher: &'r mut Dispatcher,
    config: ExecConfig,
    trace: Option<&'r mut String>,
    trace_level: u32,
    stack: Vec<Slot<'p>>,
}

impl<'r, 'p, V: VarRW + ?Sized> Run<'r, 'p, V> {
    fn program(&mut self, program: &'p Program) -> Result<FlowAction, ExecError> {
        let mut outcome = FlowAction::Default;
        for policy in &program.policies {
            outcome = self.policy(policy)?;
            if !outcome.is_default() {
                break;
            }
        }
        trace_line!(self, "Outcome of whole filter: {}", outcome);
        Ok(outcome)
    }

    fn policy(&mut self, policy: &'p Policy) -> Result<FlowAction, ExecError> {
        trace_line!(self, "Running policy: {}", policy.name);
        let mut outcome = FlowAction::Default;
        for term in &policy.terms {
            outcome = self.term(term)?;
            if !outcome.is_default() {
                break;
            }
        }
        trace_line!(self, "Outcome of policy: {}", outcome);
        Ok(outcome)
    }

    fn term(&mut self, term: &'p Term) -> Result<FlowAction, ExecError> {
        trace_line!(self, "Running term: {}", term.name);
        self.stack.clear();

        let mut action = FlowAction::Default;
        for instr in &term.instructions {
            if let Step::Finish(a) = self.step(instr)? {
                action = a;
                break;
            }
        }

        self.stack.clear();
        trace_line!(self, "Outcome of term: {}", action);
        Ok(action)
    }

    fn step(&mut self, instr: &'p Instruction) -> Result<Step, ExecError> {
        match instr {
            Instruction::Push(e) => {
                trace_line!(self, "PUSH {} {}", e.type_name(), e);
                self.push(Slot::Borrowed(e))?;
            }

            Instruction::PushSet(name) => {
                let sets: &'p dyn SetProvider = self.sets;
                let set = sets
                    .get_set(name)
                    .ok_or_else(|| ExecError::UnknownSet(name.clone()))?;
                if !matches!(set, Element::Set(_)) {
                    return Err(ExecError::NotASet {
                        name: name.clone(),
                        found: set.type_name(),
                    });
                }
                trace_line!(self, "PUSH_SET {} {}: {}", set.type_name(), name, set);
                self.push(Slot::Borrowed(set))?;
            }

            Instruction::Load(id) => {
                let value = self.varrw.read(*id);
                trace_line!(self, "LOAD {}: {}", id, value);
                self.push(Slot::Loaded(value))?;
            }

            Instruction::Store(id) => {
                let slot = self
                    .stack
                    .pop()
                    .ok_or_else(|| ExecError::StackUnderflow(instr.to_string()))?;
                let value = match slot {
                    Slot::Loaded(e) => e,
                    other => resolve(&other, self.trash.as_slice()).clone(),
                };
                self.store(*id, value)?;
            }

            Instruction::OnFalseExit => {
                let top = self
                    .stack
                    .last()
                    .ok_or_else(|| ExecError::StackUnderflow(instr.to_string()))?;
                match resolve(top, self.trash.as_slice()) {
                    Element::Null => {
                        trace_line!(self, "GOT NULL ON TOP OF STACK, GOING TO NEXT TERM");
                        return Ok(Step::Finish(FlowAction::Default));
                    }
                    Element::Bool(false) => {
                        trace_line!(self, "ONFALSE_EXIT: false");
                        return Ok(Step::Finish(FlowAction::Default));
                    }
                    Element::Bool(true) => {
                        trace_line!(self, "ONFALSE_EXIT: true");
                    }
                    other => {
                        return Err(ExecError::ExpectedBool {
                            found: other.type_name(),
                        })
                    }
                }
            }

            Instruction::Nary(op) => {
                let arity = op.arity();
                let base = self
                    .stack
                    .len()
                    .checked_sub(arity)
                    .ok_or_else(|| ExecError::StackUnderflow(instr.to_string()))?;

                let result = {
                    let trash = self.trash.as_slice();
                    let args: Vec<&Element> = self.stack[base..]
                        .iter()
                        .map(|slot| resolve(slot, trash))
                        .collect();
                    self.dispatcher.run(*op, &args)?
                };
                trace_line!(self, "{}: {}", op, result);

                self.stack.truncate(base);
                if self.trash.len() >= self.config.max_trash {
                    return Err(ExecError::TrashOverflow {
                        limit: self.config.max_trash,
                    });
                }
                self.trash.push(result);
                let index = self.trash.len() - 1;
                self.push(Slot::Temp(index))?;
            }

            Instruction::Accept => {
                trace_line!(self, "ACCEPT");
                return Ok(Step::Finish(FlowAction::Accept));
            }

            Instruction::Reject => {
                trace_line!(self, "REJECT");
                return Ok(Step::Finish(FlowAction::Reject));
            }
        }
        Ok(Step::Continue)
    }

    fn store(&mut self, id: VarId, value: Element) -> Result<(), ExecError> {
        if value.is_null() {
            trace_line!(self, "STORE NULL [treated as NOP]");
            return Ok(());
        }

        if id == VarId::TRACE {
            let level = value.as_u32().ok_or(ExecError::TraceType {
                found: value.type_name(),
            })?;
            trace_line!(self, "STORE TRACE: {}", level);
            self.trace_level = level;
            return Ok(());
        }

        trace_line!(self, "STORE {}: {}", id, value);
        self.varrw.write(id, value);
        Ok(())
    }

    fn push(&mut self, slot: Slot<'p>) -> Result<(), ExecError> {
        if self.stack.len() >= self.config.max_stack {
            return Err(ExecError::StackOverflow {
                limit: self.config.max_stack,
            });
        }
        self.stack.push(slot);
        Ok(())
    }
}
