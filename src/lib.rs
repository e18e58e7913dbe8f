pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod facts;
pub mod mailbox;
pub mod message;
pub mod normalization;
pub mod reputation;
pub mod rules;
pub mod spamfilter;
pub mod state;
pub mod training;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::DedupCache;
pub use classifier::{Classification, Classifier};
pub use config::{Action, Config, Rule, SpamSettings};
pub use error::{FilterError, Result};
pub use facts::{FactExtractor, MessageFacts};
pub use mailbox::{Connector, LocalConnector, MailSender, Mailbox, MaildirMailbox};
pub use message::MailMessage;
pub use reputation::{ReputationLookup, ReputationResolver};
pub use rules::{MessageVerdicts, RuleEvaluator, RuleMatch};
pub use spamfilter::{PassSummary, Spamfilter};
pub use state::StateFile;
