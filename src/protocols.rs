//! # Protocols
//!
//! Protocol definitions: named record types arranged in a structure tree,
//! with action rules governing who may act at each node.

mod configure;
mod query;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use self::configure::{
    Configure, ConfigureBuilder, ConfigureDescriptor, ConfigureReply,
};
pub use self::query::{ProtocolFilter, Query, QueryBuilder, QueryDescriptor, QueryReply};

/// A protocol definition: type declarations plus the structure tree of rule
/// sets.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    /// The protocol URI.
    pub protocol: String,

    /// Whether the definition can be returned by unauthorized
    /// `ProtocolsQuery` messages.
    #[serde(default)]
    pub published: bool,

    /// Declared record types, keyed by name.
    pub types: BTreeMap<String, ProtocolType>,

    /// The structure tree: rule sets keyed by type name.
    pub structure: BTreeMap<String, RuleSet>,
}

impl Definition {
    /// Create a definition for the given protocol URI.
    #[must_use]
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// Set the definition's `published` flag.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = published;
        self
    }

    /// Declare a record type.
    #[must_use]
    pub fn add_type(mut self, name: impl Into<String>, protocol_type: ProtocolType) -> Self {
        self.types.insert(name.into(), protocol_type);
        self
    }

    /// Add a top-level rule set.
    #[must_use]
    pub fn add_rule(mut self, name: impl Into<String>, rule_set: RuleSet) -> Self {
        self.structure.insert(name.into(), rule_set);
        self
    }

    /// Find the rule set at a slash-separated protocol path, or `None` when
    /// any path segment has no corresponding node.
    #[must_use]
    pub fn rule_set(&self, protocol_path: &str) -> Option<&RuleSet> {
        let mut segments = protocol_path.split('/');
        let mut rule_set = self.structure.get(segments.next()?)?;
        for segment in segments {
            rule_set = rule_set.structure.get(segment)?;
        }
        Some(rule_set)
    }
}

/// A declared record type: constraints on the schema and data formats
/// usable at structure nodes bearing the type's name.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolType {
    /// The schema records of this type must carry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Data formats allowed for records of this type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_formats: Option<Vec<String>>,
}

/// A node in the structure tree: action rules plus nested child nodes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RuleSet {
    /// The action rules applying at this node.
    #[serde(rename = "$actions")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<ActionRule>>,

    /// Child nodes, keyed by type name.
    #[serde(flatten)]
    pub structure: BTreeMap<String, RuleSet>,
}

/// An action rule: who may perform an action at a structure node.
///
/// Rules take two forms:
///
/// ```json
/// { "who": "anyone", "can": "write" }
/// { "who": "recipient", "of": "thread", "can": "read" }
/// ```
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRule {
    /// The actor the rule applies to.
    pub who: Actor,

    /// The ancestor path the actor is matched against. Required when `who`
    /// is `author`; when `who` is `recipient` and `of` is unset the rule
    /// applies to the target record's own recipient.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub of: Option<String>,

    /// The action the rule allows.
    pub can: Action,
}

/// Actor selectors usable in action rules.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Actor {
    /// Any DID, including anonymous parties.
    #[default]
    Anyone,

    /// The author of the ancestor record at the rule's `of` path.
    Author,

    /// The recipient of the ancestor record at the rule's `of` path.
    Recipient,
}

/// Actions governable by action rules.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Create or update a record.
    Write,

    /// Read a record.
    #[default]
    Read,

    /// Query for records.
    Query,

    /// Subscribe to record events.
    Subscribe,

    /// Delete a record.
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> Definition {
        Definition::new("https://example.com/chat")
            .add_type("thread", ProtocolType::default())
            .add_type("message", ProtocolType::default())
            .add_rule("thread", RuleSet {
                actions: None,
                structure: BTreeMap::from([("message".to_string(), RuleSet::default())]),
            })
    }

    #[test]
    fn rule_set_resolution() {
        let definition = definition();
        assert!(definition.rule_set("thread").is_some());
        assert!(definition.rule_set("thread/message").is_some());
        assert!(definition.rule_set("thread/reply").is_none());
        assert!(definition.rule_set("message").is_none());
    }
}
