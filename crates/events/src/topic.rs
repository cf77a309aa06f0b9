//! Topic names and the fixed topic set a process is configured with.

use std::collections::BTreeSet;

use thiserror::Error;

use hap_core::ErrorKind;

pub const APPOINTMENTS_CREATED: &str = "appointments.created";
pub const APPOINTMENTS_UPDATED: &str = "appointments.updated";
pub const APPOINTMENTS_CANCELED: &str = "appointments.canceled";

pub const PAYMENTS_RECORDED: &str = "payments.recorded";
pub const PAYMENTS_UPDATED: &str = "payments.updated";
pub const PAYMENTS_DELETED: &str = "payments.deleted";
pub const INVOICES_MARKED_PAID: &str = "invoices.marked_paid";

pub const APPOINTMENT_TOPICS: [&str; 3] = [APPOINTMENTS_CREATED, APPOINTMENTS_UPDATED, APPOINTMENTS_CANCELED];

pub const BILLING_TOPICS: [&str; 4] = [
    PAYMENTS_RECORDED,
    PAYMENTS_UPDATED,
    PAYMENTS_DELETED,
    INVOICES_MARKED_PAID,
];

const MAX_TOPIC_LEN: usize = 249;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic set must not be empty")]
    Empty,

    #[error("invalid topic name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

impl TopicError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Check a topic name: non-empty, at most 249 chars of `[A-Za-z0-9._-]`.
pub fn validate_topic_name(name: &str) -> Result<(), TopicError> {
    let invalid = |reason| TopicError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_TOPIC_LEN {
        return Err(invalid("longer than 249 characters"));
    }
    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid("only ASCII letters, digits, '.', '_' and '-' are allowed"));
    }

    Ok(())
}

/// The set of topics fixed at startup.
///
/// Ordered and de-duplicated; every member has passed [`validate_topic_name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    topics: BTreeSet<String>,
}

impl TopicSet {
    pub fn new<I, S>(topics: I) -> Result<Self, TopicError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for topic in topics {
            let topic = topic.into();
            validate_topic_name(&topic)?;
            set.insert(topic);
        }

        if set.is_empty() {
            return Err(TopicError::Empty);
        }

        Ok(Self { topics: set })
    }

    /// Parse a comma-separated list, ignoring surrounding whitespace and blanks.
    pub fn parse_list(raw: &str) -> Result<Self, TopicError> {
        Self::new(raw.split(',').map(str::trim).filter(|t| !t.is_empty()))
    }

    /// Appointment lifecycle topics plus every billing topic.
    pub fn defaults() -> Self {
        Self {
            topics: APPOINTMENT_TOPICS
                .iter()
                .chain(BILLING_TOPICS.iter())
                .map(|t| t.to_string())
                .collect(),
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl core::fmt::Display for TopicSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_appointment_and_billing_topics() {
        let set = TopicSet::defaults();
        assert_eq!(set.len(), 7);
        assert!(set.contains(APPOINTMENTS_CANCELED));
        assert!(set.contains(INVOICES_MARKED_PAID));
        assert!(!set.contains("unknown.topic"));
    }

    #[test]
    fn parse_list_trims_and_dedupes() {
        let set = TopicSet::parse_list(" payments.recorded, ,payments.recorded,appointments.created ").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["appointments.created", "payments.recorded"]);
    }

    #[test]
    fn empty_list_is_rejected() {
        assert_eq!(TopicSet::parse_list(" , "), Err(TopicError::Empty));
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(validate_topic_name("payments recorded").is_err());
        assert!(validate_topic_name("..").is_err());
        assert!(validate_topic_name(&"a".repeat(250)).is_err());
        assert!(validate_topic_name("payments.recorded-v2_eu").is_ok());
    }

    #[test]
    fn display_joins_with_commas() {
        let set = TopicSet::new(["b.topic", "a.topic"]).unwrap();
        assert_eq!(set.to_string(), "a.topic,b.topic");
    }
}
