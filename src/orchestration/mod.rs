//! Governance-gap orchestration: similarity analysis, the agent bus, and
//! the coordinator that turns gaps into drafts.

pub mod bus;
pub mod coordinator;
pub mod similarity;

pub use bus::{AgentBus, AgentHandler, AgentMessage, BusError, MessagePriority};
pub use coordinator::{
    DraftAuthor, OrchestrationCoordinator, OrchestrationError, OrchestrationOutcome,
    OrchestrationSession, SessionStatus, SimulatedAuthor,
};
pub use similarity::{
    AnalysisRequest, GovernanceAnalysis, LexicalMetric, Recommendation, SimilarRecord,
    SimilarityAnalyzer,
};
