//! Conversation graph semantics: tip CAS, traversal and the mutation engine.

pub mod cas;
pub mod engine;
pub mod traverse;

pub use cas::advance_tip;
pub use engine::{
    AppendOutcome, AppendRequest, BranchEngine, DeleteAffected, DeleteOutcome, GraphView,
    HistoryView, InjectOutcome, InjectedReference, JumpOutcome, ReplaceOutcome, RetargetedTip,
    StartOutcome, StartRequest,
};
pub use traverse::FollowsAdjacency;
