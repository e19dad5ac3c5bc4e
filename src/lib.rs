pub mod address;
pub mod audit;
pub mod auth;
pub mod batch;
pub mod config;
pub mod filter;
pub mod gmail;
pub mod mailbox;
pub mod settings;
pub mod store;

pub use address::extract_address;
pub use audit::AuditLog;
pub use batch::{BatchError, BatchOptions, BatchProcessor, BatchReport};
pub use config::{Action, MatchType, Rule, RuleSet};
pub use filter::{decide, Decision, RuleEngine};
pub use mailbox::{MailError, MailSession, MessageHeaders, NormalizedMessage};
pub use settings::Settings;
pub use store::{RuleStore, StoreError};
