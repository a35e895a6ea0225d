pub mod autopilot;
pub mod coordination;
pub mod graph;
pub mod planner;
pub mod registry;
pub mod sessions;
pub mod task_store;

pub use autopilot::AutopilotLoop;
pub use coordination::{Coordinator, Exchange, GateOutcome, ScheduleView};
pub use planner::{PlanFile, Planner};
pub use registry::{AgentRegistry, AgentUpdate};
pub use sessions::{SessionStatus, SessionSummary, SessionTable};
pub use task_store::TaskStore;
