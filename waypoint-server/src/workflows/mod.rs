pub mod travel;

pub use travel::travel_agent_workflow;
