pub mod agent;
pub mod guardrail;
pub mod handoff;
pub mod message;
pub mod run;
pub mod tool;
