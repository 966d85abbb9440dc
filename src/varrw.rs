//! # Route Variable Access
//!
//! The interpreter never touches a route directly. It reads and writes route
//! attributes through a `VarRW` keyed by numeric variable ids, and calls
//! `sync()` once at the end of every successful run to commit writes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::element::Element;

/// Numeric identifier of a route variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarId(pub u32);

impl VarId {
    /// Metavariable: storing a u32 here sets the trace level of the run
    pub const TRACE: VarId = VarId(0);
    /// Policy tags attached to the route (`set_u32`)
    pub const POLICYTAGS: VarId = VarId(1);
    pub const FILTER_IM: VarId = VarId(2);
    pub const FILTER_SM: VarId = VarId(3);
    pub const FILTER_EX: VarId = VarId(4);
    /// First id available to protocol specific variables
    pub const PROTOCOL: VarId = VarId(5);

    pub const fn new(id: u32) -> Self {
        VarId(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Protocol specific id `offset` places after `PROTOCOL`
    pub const fn protocol(offset: u32) -> Self {
        VarId(Self::PROTOCOL.0 + offset)
    }

    /// True for the ids shared by every protocol
    pub const fn is_reserved(self) -> bool {
        self.0 < Self::PROTOCOL.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for VarId {
    fn from(id: u32) -> Self {
        VarId(id)
    }
}

/// Outcome of a term, a policy, or a whole filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FlowAction {
    Accept,
    Reject,
    /// No decision was taken; the caller applies its default
    #[default]
    Default,
}

impl FlowAction {
    pub fn is_default(self) -> bool {
        self == FlowAction::Default
    }
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAction::Accept => f.write_str("Accept"),
            FlowAction::Reject => f.write_str("Reject"),
            FlowAction::Default => f.write_str("Default action"),
        }
    }
}

/// Read/write access to the variables of one route.
///
/// Implementations decide which ids exist and which are writable. Reading an
/// id that does not apply to the route returns `Element::Null`, never an
/// error.
pub trait VarRW {
    /// Returns the current value of `id`, or Null
    fn read(&mut self, id: VarId) -> Element;

    /// Records a new value for `id`. Never called with Null.
    fn write(&mut self, id: VarId, value: Element);

    /// Commits the writes of the current run. Called exactly once per
    /// successful run.
    fn sync(&mut self);

    /// Whether the interpreter may produce a trace for this route
    fn trace_allowed(&self) -> bool {
        true
    }

    /// Drops buffered writes after a failed run
    fn discard(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapVarRW {
        vars: HashMap<VarId, Element>,
        syncs: usize,
    }

    impl VarRW for MapVarRW {
        fn read(&mut self, id: VarId) -> Element {
            self.vars.get(&id).cloned().unwrap_or(Element::Null)
        }

        fn write(&mut self, id: VarId, value: Element) {
            self.vars.insert(id, value);
        }

        fn sync(&mut self) {
            self.syncs += 1;
        }
    }

    #[test]
    fn reserved_ids() {
        assert!(VarId::TRACE.is_reserved());
        assert!(VarId::FILTER_EX.is_reserved());
        assert!(!VarId::PROTOCOL.is_reserved());
        assert_eq!(VarId::protocol(2), VarId(7));
        assert_eq!(VarId::POLICYTAGS.to_string(), "1");
    }

    #[test]
    fn flow_action_strings() {
        assert_eq!(FlowAction::Accept.to_string(), "Accept");
        assert_eq!(FlowAction::Default.to_string(), "Default action");
        assert!(FlowAction::default().is_default());
    }

    #[test]
    fn trait_defaults() {
        let mut rw = MapVarRW {
            vars: HashMap::new(),
            syncs: 0,
        };
        assert!(rw.trace_allowed());
        assert_eq!(rw.read(VarId::PROTOCOL), Element::Null);
        rw.write(VarId::PROTOCOL, Element::U32(4));
        rw.discard();
        assert_eq!(rw.read(VarId::PROTOCOL), Element::U32(4));
        rw.sync();
        assert_eq!(rw.syncs, 1);
    }
}
