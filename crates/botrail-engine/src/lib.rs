pub mod graph;
pub mod map;
pub mod routing;
pub mod runtime;
pub mod snapshot;
pub mod step;
pub mod typing;

pub use graph::{
    compile, compile_with, Edge, EdgeKind, MapRegion, Routing, StepDescriptor, StepRegistry,
    ValidatedGraph,
};
pub use map::LoopFrame;
pub use routing::{resolve_next, route_key, NextAction};
pub use runtime::{Engine, ResumeRequest, RunFailure, RunOptions, RunOutcome, RunResult};
pub use snapshot::{ExecutionSnapshot, PendingInvocation, RunState, TerminalState};
pub use step::{LoopMeta, RouteResolver, StepContext, StepFn};
