//! Base-topic namespacing.

/// Prefixes outgoing topics with the configured base topic and strips it
/// from incoming ones. An empty base leaves topics untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicNamespace {
    base: String,
}

impl TopicNamespace {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn apply(&self, topic: &str) -> String {
        if self.base.is_empty() {
            topic.to_string()
        } else {
            format!("{}/{}", self.base, topic.trim_start_matches('/'))
        }
    }

    /// Topics outside the namespace are returned unchanged.
    pub fn strip<'a>(&self, topic: &'a str) -> &'a str {
        if self.base.is_empty() {
            return topic;
        }
        topic
            .strip_prefix(self.base.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(topic)
    }
}
