pub mod engine;
pub mod kinds;
pub mod state;
pub mod transition;
pub mod validators;

pub use engine::{Resolved, TransitionEngine};
pub use kinds::{Dispatch, DispatchPayload, Draft, ProductRequest, RecordKind, RequestPayload};
pub use state::RecordState;
pub use transition::{Decision, Resolution, Transition};
pub use validators::Guard;
