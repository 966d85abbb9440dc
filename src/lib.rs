//! # Policy VM
//!
//! Stack-based policy filter engine. A compiled `Program` is run against one
//! route at a time through a `VarRW`, yielding Accept, Reject or Default.

pub mod element;
pub mod exec;
pub mod factory;
pub mod net;
pub mod operator;
pub mod policy_filter;
pub mod program;
pub mod route_varrw;
pub mod set_manager;
pub mod single_varrw;
pub mod varrw;

pub use element::{ElemSet, ElemType, Element, ElementError};

pub use factory::ElementFactory;

pub use net::{Ipv4Net, Ipv6Net, NetParseError};

pub use operator::{
    Dispatcher,             // Operator dispatch + regex cache
    Operator,               // Operator catalog
    OperatorError,          // Type mismatches
};

pub use program::{
    Instruction,            // Closed instruction set
    Policy,                 // Ordered terms
    Program,                // Ordered policies
    ProgramError,           // Validation and JSON errors
    Term,                   // Straight-line instruction sequence
    TermBuilder,            // Fluent term construction
};

pub use set_manager::{SetManager, SetProvider};

pub use varrw::{FlowAction, VarId, VarRW};

pub use single_varrw::{SingleVarBackend, SingleVarRW, VarInit};

pub use route_varrw::{RouteBackend, RouteEntry, RouteNet, RouteVarRW};

pub use exec::{
    evaluate,               // One-shot evaluation
    ErrorKind,              // Bind / type / internal
    Evaluation,             // Outcome + trace
    ExecConfig,             // Interpreter limits
    ExecError,              // Run failures
    IvExec,                 // The interpreter
    SharedSets,             // Shared set provider
};

pub use policy_filter::{
    CompiledFilter,         // Immutable snapshot
    FilterConfig,           // Filter configuration
    FilterHandle,           // Shared snapshot handle
    FilterStats,            // Evaluation statistics
    PolicyFilter,           // Filter stage with atomic swap
};
