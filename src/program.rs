// Compiled policy programs.
//
// A program is an ordered list of policies, each an ordered list of terms,
// each a linear sequence of stack instructions. Programs are produced by a
// compiler elsewhere; this module only holds them, checks them and moves
// them in and out of JSON.
//
// Design Principles:
// 1. Closed instruction set - execution is a match over Instruction
// 2. Immutable once built - the interpreter shares programs through Arc
// 3. Terms are straight-line code, so stack depth can be checked statically
//    before a program is ever run

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::element::Element;
use crate::operator::Operator;
use crate::varrw::VarId;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while validating, loading or storing a program
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("Stack underflow in policy {policy} term {term} at instruction {position} ({instruction})")]
    StackUnderflow {
        policy: String,
        term: String,
        position: usize,
        instruction: String,
    },

    #[error("Stack overflow in policy {policy} term {term} at instruction {position}: limit {limit}")]
    StackOverflow {
        policy: String,
        term: String,
        position: usize,
        limit: usize,
    },

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

// ============================================================================
// Instructions
// ============================================================================

/// One interpreter instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum Instruction {
    /// Push a literal element
    Push(Element),
    /// Push the named set from the set provider
    PushSet(String),
    /// End the term without a decision unless the top of stack is true
    OnFalseExit,
    /// Push the value of a route variable
    Load(VarId),
    /// Pop a value and write it to a route variable
    Store(VarId),
    /// Pop `arity` operands and push the operator result
    Nary(Operator),
    Accept,
    Reject,
}

impl Instruction {
    /// Operands required on the stack and values left on it afterwards
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Instruction::Push(_) | Instruction::PushSet(_) | Instruction::Load(_) => (0, 1),
            Instruction::Store(_) => (1, 0),
            Instruction::OnFalseExit => (1, 1),
            Instruction::Nary(op) => (op.arity(), 1),
            Instruction::Accept | Instruction::Reject => (0, 0),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Push(e) => write!(f, "PUSH {} {}", e.type_name(), e),
            Instruction::PushSet(name) => write!(f, "PUSH_SET {}", name),
            Instruction::OnFalseExit => f.write_str("ONFALSE_EXIT"),
            Instruction::Load(id) => write!(f, "LOAD {}", id),
            Instruction::Store(id) => write!(f, "STORE {}", id),
            Instruction::Nary(op) => f.write_str(op.as_str()),
            Instruction::Accept => f.write_str("ACCEPT"),
            Instruction::Reject => f.write_str("REJECT"),
        }
    }
}

// ============================================================================
// Terms, Policies, Programs
// ============================================================================

/// Named, straight-line instruction sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub name: String,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
}

impl Term {
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            instructions,
        }
    }
}

/// Named, ordered list of terms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub terms: Vec<Term>,
}

impl Policy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            terms: Vec::new(),
        }
    }

    /// Appends a term (builder style)
    pub fn with_term(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }
}

/// Ordered list of policies run against every route
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl Program {
    /// Creates an empty program. Every route evaluates to Default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a policy (builder style)
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Total number of instructions across all terms
    pub fn instruction_count(&self) -> usize {
        self.policies
            .iter()
            .flat_map(|p| p.terms.iter())
            .map(|t| t.instructions.len())
            .sum()
    }

    /// Names of all sets referenced by PUSH_SET, in program order, deduplicated
    pub fn referenced_sets(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for instr in self
            .policies
            .iter()
            .flat_map(|p| p.terms.iter())
            .flat_map(|t| t.instructions.iter())
        {
            if let Instruction::PushSet(name) = instr {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Checks every term's stack depth against `max_stack`.
    ///
    /// Terms are straight-line code, so a single pass per term finds every
    /// underflow or overflow the interpreter could hit.
    pub fn validate(&self, max_stack: usize) -> Result<(), ProgramError> {
        for policy in &self.policies {
            for term in &policy.terms {
                let mut depth = 0usize;
                for (position, instr) in term.instructions.iter().enumerate() {
                    let (pops, pushes) = instr.stack_effect();
                    if depth < pops {
                        return Err(ProgramError::StackUnderflow {
                            policy: policy.name.clone(),
                            term: term.name.clone(),
                            position,
                            instruction: instr.to_string(),
                        });
                    }
                    depth = depth - pops + pushes;
                    if depth > max_stack {
                        return Err(ProgramError::StackOverflow {
                            policy: policy.name.clone(),
                            term: term.name.clone(),
                            position,
                            limit: max_stack,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Parse program from JSON string
    pub fn from_json(json: &str) -> Result<Self, ProgramError> {
        serde_json::from_str(json).map_err(|e| ProgramError::JsonParseError(e.to_string()))
    }

    /// Parse program from JSON bytes
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        serde_json::from_slice(bytes).map_err(|e| ProgramError::JsonParseError(e.to_string()))
    }

    /// Serialize program to pretty JSON
    pub fn to_json(&self) -> Result<String, ProgramError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ProgramError::SerializationError(e.to_string()))
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for policy in &self.policies {
            writeln!(f, "POLICY {}", policy.name)?;
            for term in &policy.terms {
                writeln!(f, "  TERM {}", term.name)?;
                for instr in &term.instructions {
                    writeln!(f, "    {}", instr)?;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Fluent builder for a single term.
///
/// # Examples
/// ```
/// use policy_vm::{Operator, TermBuilder, VarId};
///
/// let metric = VarId::protocol(5);
/// let term = TermBuilder::new("low-metric")
///     .load(metric)
///     .push(5u32)
///     .op(Operator::Lt)
///     .on_false_exit()
///     .reject()
///     .build();
/// assert_eq!(term.instructions.len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct TermBuilder {
    name: String,
    instructions: Vec<Instruction>,
}

impl TermBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
        }
    }

    pub fn push(mut self, e: impl Into<Element>) -> Self {
        self.instructions.push(Instruction::Push(e.into()));
        self
    }

    pub fn push_set(mut self, name: impl Into<String>) -> Self {
        self.instructions.push(Instruction::PushSet(name.into()));
        self
    }

    pub fn load(mut self, id: VarId) -> Self {
        self.instructions.push(Instruction::Load(id));
        self
    }

    pub fn store(mut self, id: VarId) -> Self {
        self.instructions.push(Instruction::Store(id));
        self
    }

    pub fn op(mut self, op: Operator) -> Self {
        self.instructions.push(Instruction::Nary(op));
        self
    }

    pub fn on_false_exit(mut self) -> Self {
        self.instructions.push(Instruction::OnFalseExit);
        self
    }

    pub fn accept(mut self) -> Self {
        self.instructions.push(Instruction::Accept);
        self
    }

    pub fn reject(mut self) -> Self {
        self.instructions.push(Instruction::Reject);
        self
    }

    pub fn build(self) -> Term {
        Term::new(self.name, self.instructions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric_program() -> Program {
        let term = TermBuilder::new("t")
            .load(VarId::protocol(5))
            .push(5u32)
            .op(Operator::Lt)
            .on_false_exit()
            .reject()
            .build();
        Program::new().with_policy(Policy::new("p").with_term(term))
    }

    #[test]
    fn disassembly() {
        let text = metric_program().to_string();
        assert_eq!(
            text,
            "POLICY p\n  TERM t\n    LOAD 10\n    PUSH u32 5\n    <\n    ONFALSE_EXIT\n    REJECT\n"
        );
        assert_eq!(Instruction::PushSet("nets".into()).to_string(), "PUSH_SET nets");
    }

    #[test]
    fn validate_accepts_balanced_terms() {
        let program = metric_program();
        assert!(program.validate(128).is_ok());
        assert_eq!(program.instruction_count(), 5);
    }

    #[test]
    fn validate_reports_underflow_position() {
        let term = TermBuilder::new("bad").push(1u32).op(Operator::Add).build();
        let program = Program::new().with_policy(Policy::new("p").with_term(term));
        match program.validate(128) {
            Err(ProgramError::StackUnderflow { term, position, instruction, .. }) => {
                assert_eq!(term, "bad");
                assert_eq!(position, 1);
                assert_eq!(instruction, "+");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let store = TermBuilder::new("store").store(VarId::POLICYTAGS).build();
        let program = Program::new().with_policy(Policy::new("p").with_term(store));
        assert!(matches!(program.validate(8), Err(ProgramError::StackUnderflow { .. })));
    }

    #[test]
    fn validate_reports_overflow() {
        let term = TermBuilder::new("deep").push(1u32).push(2u32).push(3u32).build();
        let program = Program::new().with_policy(Policy::new("p").with_term(term));
        assert!(matches!(
            program.validate(2),
            Err(ProgramError::StackOverflow { position: 2, limit: 2, .. })
        ));
    }

    #[test]
    fn referenced_sets_are_deduplicated() {
        let term = TermBuilder::new("t")
            .push_set("a")
            .push_set("b")
            .op(Operator::NeInt)
            .push_set("a")
            .build();
        let program = Program::new().with_policy(Policy::new("p").with_term(term));
        assert_eq!(program.referenced_sets(), vec!["a", "b"]);
    }

    #[test]
    fn json_round_trip() {
        let program = metric_program();
        let json = program.to_json().unwrap();
        assert!(json.contains("\"op\": \"on_false_exit\""));
        assert_eq!(Program::from_json(&json).unwrap(), program);

        let hand_written = r#"{"policies":[{"name":"p","terms":[{"name":"t","instructions":[
            {"op":"push","arg":{"type":"bool","value":true}},
            {"op":"on_false_exit"},
            {"op":"accept"}]}]}]}"#;
        let loaded = Program::from_json(hand_written).unwrap();
        assert_eq!(loaded.policies[0].terms[0].instructions.len(), 3);

        assert!(matches!(
            Program::from_json("{\"policies\": 3}"),
            Err(ProgramError::JsonParseError(_))
        ));
    }
}
