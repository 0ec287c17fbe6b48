//! Control-flow graph construction and symbol resolution for OOX programs.

pub mod build;
pub mod cfg;
pub mod symbols;

pub use build::{build, CfgError, CfgResult};
pub use cfg::{CfgContext, CfgNode, ControlFlowGraph, MemberRef, NodeId, NodeKind};
pub use symbols::{ClassInfo, MemberInfo, SymbolTable};
