//! Conditional rules and pushes.
//!
//! A rule turns tag values into edge-triggered actions; a "push" is a rule
//! whose primary action is an outbound webhook call.

pub mod action;
pub mod condition;
pub mod engine;

pub use action::{Action, HttpMethod, PushStatus, WebhookAction, WebhookAuth};
pub use condition::{CompareOp, Condition, LogicMode};
pub use engine::{CooldownMode, RuleConfig, RuleEngine, RuleHost, RuleState, RuleStatus};
