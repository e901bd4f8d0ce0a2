// src/lib.rs

// Import the top-level `meetmesh` module.
pub mod meetmesh;

// Re-exporting key items for easier external access.
pub use meetmesh::approval::{ApprovalCoordinator, ApprovalOutcome};
pub use meetmesh::client_wrapper::{ChatMessage, LlmClient, Role};
pub use meetmesh::config::CoordinatorConfig;
pub use meetmesh::error::{BoxError, CoordinatorError};
pub use meetmesh::event_bus::{Envelope, EventBus};
pub use meetmesh::intent::{IntentExtractor, ScheduleIntent};
pub use meetmesh::negotiation::{NegotiationEngine, NegotiationParams};
pub use meetmesh::orchestrator::{ChatOrchestrator, ChatTurn};
pub use meetmesh::personal_agent::PersonalAgent;
pub use meetmesh::protocol::{
    AgentDecision, MessageType, NegotiationMessage, NegotiationStatus, Proposal, SessionStatus,
    TimeSlot,
};
pub use meetmesh::store::{MemoryStore, Store};
