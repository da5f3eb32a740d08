//! Regex content filter — drops messages matching configured patterns.
//!
//! Rules match against the message body or the sender address. A rule can
//! exempt known contacts, so "WIN A FREE CRUISE" from a saved contact still
//! gets through while the same text from a stranger is dropped.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::EvaluatorError;
use crate::policy::{ContactsLookup, ContentFilter};

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterField {
    Body,
    Sender,
}

/// A single drop rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// Human-readable pattern description, used in logs.
    pub pattern: String,
    /// Compiled regex for matching.
    pub regex: Regex,
    /// Which message field to match.
    pub field: FilterField,
    /// Skip this rule when the sender is a known contact.
    pub exempt_contacts: bool,
}

impl FilterRule {
    /// Compile a body rule from a pattern string.
    pub fn body(pattern: &str, exempt_contacts: bool) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            regex: Regex::new(pattern)?,
            field: FilterField::Body,
            exempt_contacts,
        })
    }

    /// Compile a sender rule from a pattern string.
    pub fn sender(pattern: &str, exempt_contacts: bool) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            regex: Regex::new(pattern)?,
            field: FilterField::Sender,
            exempt_contacts,
        })
    }
}

/// Ordered regex rules evaluated against each inbound message.
pub struct RegexContentFilter {
    rules: Vec<FilterRule>,
}

impl RegexContentFilter {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    /// A filter that drops nothing.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Compile body rules (contacts exempted) from raw pattern strings,
    /// skipping ones that fail to compile.
    pub fn from_body_patterns<'a, I: IntoIterator<Item = &'a str>>(patterns: I) -> Self {
        let rules = patterns
            .into_iter()
            .filter_map(|pattern| match FilterRule::body(pattern, true) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "Skipping invalid filter pattern");
                    None
                }
            })
            .collect();
        Self { rules }
    }
}

#[async_trait]
impl ContentFilter for RegexContentFilter {
    async fn is_blocked(
        &self,
        body: &str,
        address: &str,
        contacts: &dyn ContactsLookup,
    ) -> Result<bool, EvaluatorError> {
        for rule in &self.rules {
            let haystack = match rule.field {
                FilterField::Body => body,
                FilterField::Sender => address,
            };
            if !rule.regex.is_match(haystack) {
                continue;
            }
            if rule.exempt_contacts && contacts.is_known_contact(address).await {
                debug!(pattern = %rule.pattern, "Filter match exempted for known contact");
                continue;
            }
            debug!(pattern = %rule.pattern, "Content filter matched");
            return Ok(true);
        }
        Ok(false)
    }
}
