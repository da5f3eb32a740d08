//! Policy evaluators — blocking decisions and content filtering.

pub mod filter;

pub use filter::{FilterField, FilterRule, RegexContentFilter};

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::EvaluatorError;

/// One-shot decision for an inbound message's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockingAction {
    /// Nothing to do for this address.
    NoAction,
    /// Address is blocked; `reason` is recorded on the conversation.
    Block { reason: Option<String> },
    /// Address was explicitly cleared; lift any existing block.
    Unblock,
}

/// Decides per address whether inbound messages should be blocked.
#[async_trait]
pub trait BlockingEvaluator: Send + Sync {
    async fn should_block(&self, address: &str) -> Result<BlockingAction, EvaluatorError>;
}

/// Decides whether a message body should be dropped.
#[async_trait]
pub trait ContentFilter: Send + Sync {
    async fn is_blocked(
        &self,
        body: &str,
        address: &str,
        contacts: &dyn ContactsLookup,
    ) -> Result<bool, EvaluatorError>;
}

/// Contact lookup consumed by the content filter.
#[async_trait]
pub trait ContactsLookup: Send + Sync {
    async fn is_known_contact(&self, address: &str) -> bool;
}

/// Contacts source that knows nobody. For deployments without a contacts
/// provider.
pub struct NoContacts;

#[async_trait]
impl ContactsLookup for NoContacts {
    async fn is_known_contact(&self, _address: &str) -> bool {
        false
    }
}

/// Blocking evaluator backed by explicit address lists.
///
/// Addresses are compared after stripping formatting (spaces, dashes,
/// parens), so "+1 555-000-1111" and "+15550001111" match.
pub struct AddressListEvaluator {
    blocked: HashSet<String>,
    unblocked: HashSet<String>,
}

impl AddressListEvaluator {
    pub fn new<I, J>(blocked: I, unblocked: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        Self {
            blocked: blocked.into_iter().map(|a| normalize(&a)).collect(),
            unblocked: unblocked.into_iter().map(|a| normalize(&a)).collect(),
        }
    }

    /// Evaluator that blocks nothing.
    pub fn permissive() -> Self {
        Self::new([], [])
    }
}

fn normalize(address: &str) -> String {
    address
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect::<String>()
        .to_ascii_lowercase()
}

#[async_trait]
impl BlockingEvaluator for AddressListEvaluator {
    async fn should_block(&self, address: &str) -> Result<BlockingAction, EvaluatorError> {
        let normalized = normalize(address);
        if self.blocked.contains(&normalized) {
            return Ok(BlockingAction::Block {
                reason: Some("address on local block list".to_string()),
            });
        }
        if self.unblocked.contains(&normalized) {
            return Ok(BlockingAction::Unblock);
        }
        Ok(BlockingAction::NoAction)
    }
}
