// Element type system for the policy engine.
//
// Every value that flows through the interpreter stack is an Element: a
// literal embedded in a compiled term, a named set, a route variable handed
// out by a VarRW, or the result of an operator.
//
// Design Principles:
// 1. Closed set of variants - dispatch is a match, never a virtual call
// 2. Type identity is a compile-time constant per variant (ElemType)
// 3. Cheap sharing - heavy payloads sit behind Arc, so cloning an element
//    out of a provider never deep-copies it
// 4. Canonical total order (Ord) - sets iterate in that order, which is what
//    HEAD and the string form of a set rely on
// 5. Null is a value, not an error - it marks "not applicable to this route"

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;

use crate::net::{Ipv4Net, Ipv6Net};
use crate::policy_filter::FilterHandle;

/// Type identity used for fast runtime type tests
pub type Hash = u8;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while constructing elements
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElementError {
    #[error("Unknown element type: {0}")]
    UnknownType(String),

    #[error("Unable to parse '{value}' as {type_name}: {reason}")]
    Parse {
        type_name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Elements of type {0} cannot be set members")]
    InvalidSetMember(&'static str),

    #[error("Set of {expected} cannot hold an element of type {found}")]
    MixedSet {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Elements of type {0} have no wire form")]
    NotCreatable(&'static str),
}

// ============================================================================
// Type Identity
// ============================================================================

/// Type tag of an element.
///
/// The discriminant is the element's hash: it is fixed at compile time, so
/// dispatch tables can switch on it without any registration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ElemType {
    Null = 0,
    Bool = 1,
    U32 = 2,
    I32 = 3,
    Str = 4,
    Ipv4 = 5,
    Ipv6 = 6,
    Ipv4Net = 7,
    Ipv6Net = 8,
    Set = 9,
    Filter = 10,
}

impl ElemType {
    pub const fn hash(self) -> Hash {
        self as Hash
    }

    /// Wire name of the type
    pub const fn name(self) -> &'static str {
        match self {
            ElemType::Null => "null",
            ElemType::Bool => "bool",
            ElemType::U32 => "u32",
            ElemType::I32 => "i32",
            ElemType::Str => "txt",
            ElemType::Ipv4 => "ipv4",
            ElemType::Ipv6 => "ipv6",
            ElemType::Ipv4Net => "ipv4net",
            ElemType::Ipv6Net => "ipv6net",
            ElemType::Set => "set",
            ElemType::Filter => "filter",
        }
    }

    /// Types that may be stored inside a set
    pub const fn is_set_member(self) -> bool {
        matches!(
            self,
            ElemType::U32
                | ElemType::I32
                | ElemType::Str
                | ElemType::Ipv4
                | ElemType::Ipv6
                | ElemType::Ipv4Net
                | ElemType::Ipv6Net
        )
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Element
// ============================================================================

/// A dynamically typed, immutable policy value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Element {
    /// Explicit "no value": the variable does not apply to this route
    Null,
    Bool(bool),
    U32(u32),
    I32(i32),
    Str(Arc<str>),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Ipv4Net(Ipv4Net),
    Ipv6Net(Ipv6Net),
    Set(ElemSet),
    /// Compiled, versioned sub-filter. Lives only in memory.
    #[serde(skip)]
    Filter(FilterHandle),
}

impl Element {
    /// Creates a string element
    pub fn text(s: impl Into<Arc<str>>) -> Self {
        Element::Str(s.into())
    }

    pub fn elem_type(&self) -> ElemType {
        match self {
            Element::Null => ElemType::Null,
            Element::Bool(_) => ElemType::Bool,
            Element::U32(_) => ElemType::U32,
            Element::I32(_) => ElemType::I32,
            Element::Str(_) => ElemType::Str,
            Element::Ipv4(_) => ElemType::Ipv4,
            Element::Ipv6(_) => ElemType::Ipv6,
            Element::Ipv4Net(_) => ElemType::Ipv4Net,
            Element::Ipv6Net(_) => ElemType::Ipv6Net,
            Element::Set(_) => ElemType::Set,
            Element::Filter(_) => ElemType::Filter,
        }
    }

    pub fn hash(&self) -> Hash {
        self.elem_type().hash()
    }

    /// Wire type name. Sets are named after their member type (`set_u32`, ...).
    pub fn type_name(&self) -> &'static str {
        match self {
            Element::Set(set) => ElemSet::type_name_for(set.member_type()),
            other => other.elem_type().name(),
        }
    }

    /// String representation used in traces and on the wire
    pub fn str(&self) -> String {
        self.to_string()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Element::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Element::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Element::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&ElemSet> {
        match self {
            Element::Set(set) => Some(set),
            _ => None,
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Null => f.write_str("null"),
            Element::Bool(b) => write!(f, "{}", b),
            Element::U32(v) => write!(f, "{}", v),
            Element::I32(v) => write!(f, "{}", v),
            Element::Str(s) => f.write_str(s),
            Element::Ipv4(a) => write!(f, "{}", a),
            Element::Ipv6(a) => write!(f, "{}", a),
            Element::Ipv4Net(n) => write!(f, "{}", n),
            Element::Ipv6Net(n) => write!(f, "{}", n),
            Element::Set(set) => write!(f, "{}", set),
            Element::Filter(_) => f.write_str("policy filter"),
        }
    }
}

impl From<bool> for Element {
    fn from(b: bool) -> Self {
        Element::Bool(b)
    }
}

impl From<u32> for Element {
    fn from(v: u32) -> Self {
        Element::U32(v)
    }
}

impl From<i32> for Element {
    fn from(v: i32) -> Self {
        Element::I32(v)
    }
}

impl From<&str> for Element {
    fn from(s: &str) -> Self {
        Element::Str(Arc::from(s))
    }
}

impl From<String> for Element {
    fn from(s: String) -> Self {
        Element::Str(Arc::from(s))
    }
}

impl From<Ipv4Addr> for Element {
    fn from(a: Ipv4Addr) -> Self {
        Element::Ipv4(a)
    }
}

impl From<Ipv6Addr> for Element {
    fn from(a: Ipv6Addr) -> Self {
        Element::Ipv6(a)
    }
}

impl From<Ipv4Net> for Element {
    fn from(n: Ipv4Net) -> Self {
        Element::Ipv4Net(n)
    }
}

impl From<Ipv6Net> for Element {
    fn from(n: Ipv6Net) -> Self {
        Element::Ipv6Net(n)
    }
}

impl From<ElemSet> for Element {
    fn from(set: ElemSet) -> Self {
        Element::Set(set)
    }
}

impl From<FilterHandle> for Element {
    fn from(handle: FilterHandle) -> Self {
        Element::Filter(handle)
    }
}

// ============================================================================
// Sets
// ============================================================================

/// Homogeneous, canonically ordered collection of elements.
///
/// Set operations never mutate in place: they return a new set, sharing
/// nothing with the operands except the member type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "SetWire", into = "SetWire")]
pub struct ElemSet {
    member: ElemType,
    items: Arc<BTreeSet<Element>>,
}

impl ElemSet {
    /// Creates an empty set holding `member` typed elements
    pub fn new(member: ElemType) -> Result<Self, ElementError> {
        if !member.is_set_member() {
            return Err(ElementError::InvalidSetMember(member.name()));
        }
        Ok(Self {
            member,
            items: Arc::new(BTreeSet::new()),
        })
    }

    /// Creates a set from elements, all of which must be `member` typed
    pub fn from_elements(
        member: ElemType,
        elements: impl IntoIterator<Item = Element>,
    ) -> Result<Self, ElementError> {
        let mut set = Self::new(member)?;
        let items = Arc::make_mut(&mut set.items);
        for e in elements {
            if e.elem_type() != member {
                return Err(ElementError::MixedSet {
                    expected: member.name(),
                    found: e.type_name(),
                });
            }
            items.insert(e);
        }
        Ok(set)
    }

    /// Wire type name for a set of `member` elements
    pub const fn type_name_for(member: ElemType) -> &'static str {
        match member {
            ElemType::U32 => "set_u32",
            ElemType::I32 => "set_i32",
            ElemType::Ipv4 => "set_ipv4",
            ElemType::Ipv6 => "set_ipv6",
            ElemType::Ipv4Net => "set_ipv4net",
            ElemType::Ipv6Net => "set_ipv6net",
            _ => "set",
        }
    }

    pub fn member_type(&self) -> ElemType {
        self.member
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, e: &Element) -> bool {
        self.items.contains(e)
    }

    /// Iterates members in canonical order
    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.items.iter()
    }

    /// First member in canonical order
    pub fn first(&self) -> Option<&Element> {
        self.items.iter().next()
    }

    /// Returns a copy of this set with `e` added
    pub fn with(&self, e: &Element) -> Result<Self, ElementError> {
        self.check_member(e)?;
        let mut items = (*self.items).clone();
        items.insert(e.clone());
        Ok(self.derive(items))
    }

    /// Returns a copy of this set with `e` removed
    pub fn without(&self, e: &Element) -> Result<Self, ElementError> {
        self.check_member(e)?;
        let mut items = (*self.items).clone();
        items.remove(e);
        Ok(self.derive(items))
    }

    pub fn union(&self, other: &ElemSet) -> Self {
        self.derive(self.items.union(&other.items).cloned().collect())
    }

    pub fn difference(&self, other: &ElemSet) -> Self {
        self.derive(self.items.difference(&other.items).cloned().collect())
    }

    pub fn is_subset(&self, other: &ElemSet) -> bool {
        self.items.is_subset(&other.items)
    }

    pub fn intersects(&self, other: &ElemSet) -> bool {
        !self.items.is_disjoint(&other.items)
    }

    fn check_member(&self, e: &Element) -> Result<(), ElementError> {
        if e.elem_type() != self.member {
            return Err(ElementError::MixedSet {
                expected: self.member.name(),
                found: e.type_name(),
            });
        }
        Ok(())
    }

    fn derive(&self, items: BTreeSet<Element>) -> Self {
        Self {
            member: self.member,
            items: Arc::new(items),
        }
    }
}

impl fmt::Display for ElemSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

/// Serialized form of a set; deserialization re-checks homogeneity
#[derive(Serialize, Deserialize)]
struct SetWire {
    member: ElemType,
    items: Vec<Element>,
}

impl TryFrom<SetWire> for ElemSet {
    type Error = ElementError;

    fn try_from(wire: SetWire) -> Result<Self, Self::Error> {
        ElemSet::from_elements(wire.member, wire.items)
    }
}

impl From<ElemSet> for SetWire {
    fn from(set: ElemSet) -> Self {
        SetWire {
            member: set.member,
            items: set.items.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_set(values: &[u32]) -> ElemSet {
        ElemSet::from_elements(ElemType::U32, values.iter().map(|v| Element::U32(*v))).unwrap()
    }

    #[test]
    fn type_identity_is_stable() {
        assert_eq!(Element::U32(1).hash(), Element::U32(99).hash());
        assert_ne!(Element::U32(1).hash(), Element::I32(1).hash());
        assert_eq!(Element::Null.hash(), ElemType::Null.hash());
        assert_eq!(Element::Null.type_name(), "null");
        assert_eq!(Element::from("x").type_name(), "txt");
        assert_eq!(Element::Set(u32_set(&[])).type_name(), "set_u32");
    }

    #[test]
    fn string_forms() {
        assert_eq!(Element::Bool(false).str(), "false");
        assert_eq!(Element::U32(7).str(), "7");
        assert_eq!(Element::Null.str(), "null");
        assert_eq!(Element::Set(u32_set(&[30, 10, 20])).str(), "10,20,30");
    }

    #[test]
    fn sets_are_homogeneous() {
        let err = ElemSet::from_elements(ElemType::U32, vec![Element::U32(1), Element::from("a")]);
        assert!(matches!(err, Err(ElementError::MixedSet { .. })));
        assert!(matches!(
            ElemSet::new(ElemType::Bool),
            Err(ElementError::InvalidSetMember("bool"))
        ));
    }

    #[test]
    fn set_operations_do_not_mutate_operands() {
        let base = u32_set(&[1, 2]);
        let grown = base.with(&Element::U32(3)).unwrap();
        assert_eq!(base.len(), 2);
        assert_eq!(grown.len(), 3);

        let shrunk = grown.without(&Element::U32(1)).unwrap();
        assert_eq!(shrunk.str_members(), vec!["2", "3"]);
        assert!(base.intersects(&shrunk));
        assert!(u32_set(&[2]).is_subset(&base));
        assert_eq!(base.union(&u32_set(&[9])).len(), 3);
        assert_eq!(base.difference(&u32_set(&[1])).first(), Some(&Element::U32(2)));
    }

    #[test]
    fn json_round_trip_rechecks_sets() {
        let set = Element::Set(u32_set(&[5, 1]));
        let json = serde_json::to_string(&set).unwrap();
        let back: Element = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);

        let bad = r#"{"type":"set","value":{"member":"u32","items":[{"type":"str","value":"x"}]}}"#;
        assert!(serde_json::from_str::<Element>(bad).is_err());
    }

    impl ElemSet {
        fn str_members(&self) -> Vec<String> {
            self.iter().map(|e| e.str()).collect()
        }
    }
}
