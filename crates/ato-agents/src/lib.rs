pub mod actions;
pub mod command_runner;
pub mod planner;
pub mod prompts;
pub mod state_machine;
pub mod task_orchestrator;
