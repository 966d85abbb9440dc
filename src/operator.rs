// Operator catalog and dispatch for the policy engine.
//
// Operators are applied by the interpreter to the top `arity` stack slots.
// Dispatch is a single match keyed on the operator and the operand variants,
// so adding a type combination is one new arm.
//
// Design Principles:
// 1. Operand order is push order - the first pushed operand is the left one
// 2. Null in, Null out - a variable that does not apply poisons the result
//    instead of failing the run
// 3. Results are fresh elements; operands are never modified
// 4. Unsupported combinations are type errors that abort the run

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::element::{ElemSet, Element, ElementError};

/// Compiled patterns kept by one dispatcher before the cache is flushed
const REGEX_CACHE_LIMIT: usize = 256;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperatorError {
    #[error("Operator {op} not supported for ({types})")]
    TypeMismatch { op: Operator, types: String },

    #[error("Operator {op} takes {expected} operand(s), got {found}")]
    Arity {
        op: Operator,
        expected: usize,
        found: usize,
    },

    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("Element error: {0}")]
    Element(#[from] ElementError),
}

impl OperatorError {
    fn mismatch(op: Operator, args: &[&Element]) -> Self {
        let types = args
            .iter()
            .map(|a| a.type_name())
            .collect::<Vec<_>>()
            .join(", ");
        OperatorError::TypeMismatch { op, types }
    }
}

// ============================================================================
// Operators
// ============================================================================

/// Every operator the interpreter can apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    And,
    Or,
    Xor,
    Not,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Regex,
    /// Set contains member (or subset)
    Ctr,
    /// Two sets share at least one member
    NeInt,
    /// First member of a set
    Head,
}

impl Operator {
    /// Number of operands popped from the stack
    pub const fn arity(self) -> usize {
        match self {
            Operator::Not | Operator::Head => 1,
            _ => 2,
        }
    }

    /// Symbol used in traces and disassembly
    pub const fn as_str(self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
            Operator::Xor => "XOR",
            Operator::Not => "NOT",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Regex => "REGEX",
            Operator::Ctr => "CTR",
            Operator::NeInt => "NON_EMPTY_INTERSECTION",
            Operator::Head => "HEAD",
        }
    }

    fn is_relational(self) -> bool {
        matches!(self, Operator::Lt | Operator::Gt | Operator::Le | Operator::Ge)
    }

    /// Applies a relational operator to an ordering of left vs right
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Operator::Lt => ord == Ordering::Less,
            Operator::Le => ord != Ordering::Greater,
            Operator::Gt => ord == Ordering::Greater,
            Operator::Ge => ord != Ordering::Less,
            _ => false,
        }
    }

    fn holds_for(self, ord: Option<Ordering>) -> bool {
        ord.map_or(false, |o| self.holds(o))
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Applies operators to operands.
///
/// Holds the compiled REGEX patterns, so one dispatcher per interpreter.
#[derive(Debug, Default)]
pub struct Dispatcher {
    regex_cache: HashMap<String, Regex>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op` over `args`, given in push order.
    ///
    /// # Examples
    /// ```
    /// use policy_vm::{Dispatcher, Element, Operator};
    ///
    /// let mut d = Dispatcher::new();
    /// let r = d.run(Operator::Lt, &[&Element::U32(3), &Element::U32(5)]).unwrap();
    /// assert_eq!(r, Element::Bool(true));
    /// ```
    pub fn run(&mut self, op: Operator, args: &[&Element]) -> Result<Element, OperatorError> {
        if args.len() != op.arity() {
            return Err(OperatorError::Arity {
                op,
                expected: op.arity(),
                found: args.len(),
            });
        }

        if args.iter().any(|a| a.is_null()) {
            return Ok(Element::Null);
        }

        let result = match args {
            [arg] => Self::unary(op, arg),
            [left, right] => self.binary(op, left, right)?,
            _ => None,
        };
        result.ok_or_else(|| OperatorError::mismatch(op, args))
    }

    /// Number of compiled patterns currently cached
    pub fn cached_patterns(&self) -> usize {
        self.regex_cache.len()
    }

    fn unary(op: Operator, arg: &Element) -> Option<Element> {
        match (op, arg) {
            (Operator::Not, Element::Bool(b)) => Some(Element::Bool(!b)),
            (Operator::Head, Element::Set(set)) => {
                Some(set.first().cloned().unwrap_or(Element::Null))
            }
            _ => None,
        }
    }

    /// Returns `Ok(None)` when the combination is unsupported
    fn binary(
        &mut self,
        op: Operator,
        left: &Element,
        right: &Element,
    ) -> Result<Option<Element>, OperatorError> {
        use Element as E;

        let result = match (op, left, right) {
            (Operator::And, E::Bool(a), E::Bool(b)) => E::Bool(*a && *b),
            (Operator::Or, E::Bool(a), E::Bool(b)) => E::Bool(*a || *b),
            (Operator::Xor, E::Bool(a), E::Bool(b)) => E::Bool(a ^ b),

            (Operator::Eq, l, r) => match Self::equal(l, r) {
                Some(eq) => E::Bool(eq),
                None => return Ok(None),
            },
            (Operator::Ne, l, r) => match Self::equal(l, r) {
                Some(eq) => E::Bool(!eq),
                None => return Ok(None),
            },
            (op, l, r) if op.is_relational() => match Self::relate(op, l, r) {
                Some(holds) => E::Bool(holds),
                None => return Ok(None),
            },

            (Operator::Add, E::U32(a), E::U32(b)) => E::U32(a.wrapping_add(*b)),
            (Operator::Sub, E::U32(a), E::U32(b)) => E::U32(a.wrapping_sub(*b)),
            (Operator::Mul, E::U32(a), E::U32(b)) => E::U32(a.wrapping_mul(*b)),
            (Operator::Add, E::I32(a), E::I32(b)) => E::I32(a.wrapping_add(*b)),
            (Operator::Sub, E::I32(a), E::I32(b)) => E::I32(a.wrapping_sub(*b)),
            (Operator::Mul, E::I32(a), E::I32(b)) => E::I32(a.wrapping_mul(*b)),

            (Operator::Add, E::Set(a), E::Set(b)) if same_members(a, b) => E::Set(a.union(b)),
            (Operator::Sub, E::Set(a), E::Set(b)) if same_members(a, b) => {
                E::Set(a.difference(b))
            }
            (Operator::Add, E::Set(s), m) if is_member(s, m) => E::Set(s.with(m)?),
            (Operator::Sub, E::Set(s), m) if is_member(s, m) => E::Set(s.without(m)?),

            (Operator::Regex, E::Str(subject), E::Str(pattern)) => {
                E::Bool(self.regex(pattern)?.is_match(subject))
            }

            (Operator::Ctr, E::Set(a), E::Set(b)) if same_members(a, b) => E::Bool(b.is_subset(a)),
            (Operator::Ctr, E::Set(s), m) if is_member(s, m) => E::Bool(s.contains(m)),
            (Operator::NeInt, E::Set(a), E::Set(b)) if same_members(a, b) => {
                E::Bool(a.intersects(b))
            }

            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    /// Equality: same types compare by value, an address against a prefix of
    /// its family tests containment
    fn equal(left: &Element, right: &Element) -> Option<bool> {
        use Element as E;

        match (left, right) {
            (E::Ipv4(a), E::Ipv4Net(n)) | (E::Ipv4Net(n), E::Ipv4(a)) => Some(n.contains(a)),
            (E::Ipv6(a), E::Ipv6Net(n)) | (E::Ipv6Net(n), E::Ipv6(a)) => Some(n.contains(a)),
            (E::Set(a), E::Set(b)) if !same_members(a, b) => None,
            (l, r) if l.elem_type() == r.elem_type() => Some(l == r),
            _ => None,
        }
    }

    fn relate(op: Operator, left: &Element, right: &Element) -> Option<bool> {
        use Element as E;

        let within = matches!(op, Operator::Lt | Operator::Le);
        match (left, right) {
            (E::U32(a), E::U32(b)) => Some(op.holds(a.cmp(b))),
            (E::I32(a), E::I32(b)) => Some(op.holds(a.cmp(b))),
            (E::Str(a), E::Str(b)) => Some(op.holds(a.cmp(b))),

            (E::Ipv4Net(a), E::Ipv4Net(b)) => {
                Some(op.holds_for(containment(a == b, b.contains_net(a), a.contains_net(b))))
            }
            (E::Ipv6Net(a), E::Ipv6Net(b)) => {
                Some(op.holds_for(containment(a == b, b.contains_net(a), a.contains_net(b))))
            }

            (E::Ipv4(a), E::Ipv4Net(n)) if within => Some(n.contains(a)),
            (E::Ipv6(a), E::Ipv6Net(n)) if within => Some(n.contains(a)),
            (E::Ipv4Net(n), E::Ipv4(a)) if !within => Some(n.contains(a)),
            (E::Ipv6Net(n), E::Ipv6(a)) if !within => Some(n.contains(a)),

            (E::Set(a), E::Set(b)) if same_members(a, b) => Some(op.holds_for(containment(
                a == b,
                a.is_subset(b),
                b.is_subset(a),
            ))),

            _ => None,
        }
    }

    fn regex(&mut self, pattern: &str) -> Result<&Regex, OperatorError> {
        if !self.regex_cache.contains_key(pattern) {
            let compiled = Regex::new(pattern).map_err(|e| OperatorError::InvalidRegex {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
            if self.regex_cache.len() >= REGEX_CACHE_LIMIT {
                self.regex_cache.clear();
            }
            self.regex_cache.insert(pattern.to_string(), compiled);
        }
        Ok(&self.regex_cache[pattern])
    }
}

fn same_members(a: &ElemSet, b: &ElemSet) -> bool {
    a.member_type() == b.member_type()
}

fn is_member(set: &ElemSet, e: &Element) -> bool {
    !matches!(e, Element::Set(_)) && e.elem_type() == set.member_type()
}

/// Maps a containment relation onto an ordering: contained is "less".
/// Unrelated operands have no ordering.
fn containment(equal: bool, left_inside: bool, right_inside: bool) -> Option<Ordering> {
    if equal {
        Some(Ordering::Equal)
    } else if left_inside {
        Some(Ordering::Less)
    } else if right_inside {
        Some(Ordering::Greater)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElemType;
    use crate::factory::ElementFactory;

    fn el(type_name: &str, value: &str) -> Element {
        ElementFactory::create(type_name, Some(value)).unwrap()
    }

    fn run(op: Operator, args: &[&Element]) -> Result<Element, OperatorError> {
        Dispatcher::new().run(op, args)
    }

    #[test]
    fn arity_is_declared_per_operator() {
        assert_eq!(Operator::Not.arity(), 1);
        assert_eq!(Operator::Head.arity(), 1);
        assert_eq!(Operator::Lt.arity(), 2);
        assert_eq!(Operator::NeInt.to_string(), "NON_EMPTY_INTERSECTION");

        let err = run(Operator::Not, &[&Element::Bool(true), &Element::Bool(false)]);
        assert!(matches!(err, Err(OperatorError::Arity { expected: 1, found: 2, .. })));
    }

    #[test]
    fn logical_operators() {
        let t = Element::Bool(true);
        let f = Element::Bool(false);
        assert_eq!(run(Operator::And, &[&t, &f]).unwrap(), f);
        assert_eq!(run(Operator::Or, &[&t, &f]).unwrap(), t);
        assert_eq!(run(Operator::Xor, &[&t, &t]).unwrap(), f);
        assert_eq!(run(Operator::Not, &[&f]).unwrap(), t);
    }

    #[test]
    fn left_operand_is_first_pushed() {
        let metric = Element::U32(3);
        let five = Element::U32(5);
        assert_eq!(run(Operator::Lt, &[&metric, &five]).unwrap(), Element::Bool(true));
        assert_eq!(run(Operator::Lt, &[&five, &metric]).unwrap(), Element::Bool(false));
        assert_eq!(run(Operator::Sub, &[&five, &metric]).unwrap(), Element::U32(2));
        assert_eq!(run(Operator::Ge, &[&five, &five]).unwrap(), Element::Bool(true));
    }

    #[test]
    fn null_operand_yields_null() {
        assert_eq!(run(Operator::Lt, &[&Element::Null, &Element::U32(5)]).unwrap(), Element::Null);
        assert_eq!(run(Operator::Not, &[&Element::Null]).unwrap(), Element::Null);
    }

    #[test]
    fn arithmetic_wraps() {
        assert_eq!(
            run(Operator::Add, &[&Element::U32(u32::MAX), &Element::U32(1)]).unwrap(),
            Element::U32(0)
        );
        assert_eq!(
            run(Operator::Mul, &[&Element::I32(-3), &Element::I32(4)]).unwrap(),
            Element::I32(-12)
        );
    }

    #[test]
    fn prefix_relations() {
        let wide = el("ipv4net", "10.0.0.0/8");
        let narrow = el("ipv4net", "10.1.0.0/16");
        let other = el("ipv4net", "192.168.0.0/16");
        let addr = el("ipv4", "10.1.2.3");

        assert_eq!(run(Operator::Lt, &[&narrow, &wide]).unwrap(), Element::Bool(true));
        assert_eq!(run(Operator::Lt, &[&wide, &wide]).unwrap(), Element::Bool(false));
        assert_eq!(run(Operator::Le, &[&wide, &wide]).unwrap(), Element::Bool(true));
        assert_eq!(run(Operator::Gt, &[&wide, &narrow]).unwrap(), Element::Bool(true));
        assert_eq!(run(Operator::Le, &[&other, &wide]).unwrap(), Element::Bool(false));
        assert_eq!(run(Operator::Ge, &[&other, &wide]).unwrap(), Element::Bool(false));

        assert_eq!(run(Operator::Le, &[&addr, &narrow]).unwrap(), Element::Bool(true));
        assert_eq!(run(Operator::Ge, &[&wide, &addr]).unwrap(), Element::Bool(true));
        assert_eq!(run(Operator::Eq, &[&addr, &other]).unwrap(), Element::Bool(false));
        assert!(run(Operator::Gt, &[&addr, &wide]).is_err());
    }

    #[test]
    fn set_operators() {
        let tags = el("set_u32", "1,2,3");
        let some = el("set_u32", "2,3");
        let none = el("set_u32", "7");

        assert_eq!(run(Operator::Ctr, &[&tags, &Element::U32(2)]).unwrap(), Element::Bool(true));
        assert_eq!(run(Operator::Ctr, &[&tags, &some]).unwrap(), Element::Bool(true));
        assert_eq!(run(Operator::NeInt, &[&tags, &none]).unwrap(), Element::Bool(false));
        assert_eq!(run(Operator::Lt, &[&some, &tags]).unwrap(), Element::Bool(true));
        assert_eq!(run(Operator::Le, &[&none, &tags]).unwrap(), Element::Bool(false));

        let grown = run(Operator::Add, &[&tags, &Element::U32(9)]).unwrap();
        assert_eq!(grown.str(), "1,2,3,9");
        assert_eq!(tags.str(), "1,2,3");
        assert_eq!(run(Operator::Sub, &[&tags, &some]).unwrap().str(), "1");

        assert_eq!(run(Operator::Head, &[&tags]).unwrap(), Element::U32(1));
        let empty = Element::Set(ElemSet::new(ElemType::U32).unwrap());
        assert_eq!(run(Operator::Head, &[&empty]).unwrap(), Element::Null);
    }

    #[test]
    fn regex_is_unanchored_and_cached() {
        let mut d = Dispatcher::new();
        let subject = Element::from("as-path 65001 65002");
        let pattern = Element::from("6500[12]");
        assert_eq!(d.run(Operator::Regex, &[&subject, &pattern]).unwrap(), Element::Bool(true));
        assert_eq!(d.run(Operator::Regex, &[&subject, &pattern]).unwrap(), Element::Bool(true));
        assert_eq!(d.cached_patterns(), 1);

        let bad = Element::from("(");
        assert!(matches!(
            d.run(Operator::Regex, &[&subject, &bad]),
            Err(OperatorError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn unsupported_combinations_are_type_errors() {
        let err = run(Operator::Add, &[&Element::U32(1), &Element::from("x")]).unwrap_err();
        assert_eq!(err.to_string(), "Operator + not supported for (u32, txt)");
        assert!(run(Operator::Eq, &[&Element::U32(1), &Element::I32(1)]).is_err());
        assert!(run(Operator::Ctr, &[&el("set_u32", "1"), &Element::from("a")]).is_err());
    }
}
