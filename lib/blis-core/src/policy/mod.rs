//! Policy traits (spec.md §9 "policies as interfaces") and their concrete
//! variants. Each trait is single-method (or close to it) so a new variant
//! is a new struct, never a change to a call site.

pub mod admission;
pub mod factory;
pub mod priority;
pub mod routing;
pub mod scheduler;
pub mod scorer;

pub use admission::{AdmissionDecision, AdmissionPolicy};
pub use priority::PriorityPolicy;
pub use routing::{RoutingPolicy, RoutingSnapshot};
pub use scheduler::SchedulingPolicy;
pub use scorer::Scorer;
