//! Workflow graph declaration and compilation.
//!
//! Steps are declared as `StepDescriptor`s in a `StepRegistry`. `compile`
//! checks start uniqueness, route targets, edge types, name-based cycle
//! legality, map regions, and reachability, then freezes the result into a
//! `ValidatedGraph`. Nothing is executed here.

mod cycles;
pub mod descriptor;
pub mod edge;
pub mod regions;
pub mod validator;

pub use descriptor::{Routing, StepDescriptor, StepRegistry};
pub use edge::{Edge, EdgeKind};
pub use regions::MapRegion;
pub use validator::{compile, compile_with, ValidatedGraph};
