//! Admission decisions: caller identification, rules and the engine.

mod backend;
mod engine;
mod identity;
mod resolver;
mod rules;
mod window;

pub use backend::AdmissionBackend;
pub use engine::{DecisionEngine, Verdict};
pub use identity::Identifier;
pub use resolver::{Resolution, RuleResolver};
pub use rules::{parse_token_overrides, Mode, Rule, RuleOverride};
pub use window::{block_store_key, WindowKey, WINDOW};
