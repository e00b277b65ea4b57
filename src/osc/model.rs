// ABOUTME: Change records decoded from osmChange documents
// ABOUTME: One record per created, modified or deleted node/way/relation

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// What happened to an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Modify,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Modify => "modify",
            Action::Delete => "delete",
        }
    }

    pub fn from_tag(name: &[u8]) -> Option<Self> {
        match name {
            b"create" => Some(Action::Create),
            b"modify" => Some(Action::Modify),
            b"delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OSM element type, as used for relation members and tag rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Node,
    Way,
    Relation,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Node => "node",
            ElementType::Way => "way",
            ElementType::Relation => "relation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "node" => Some(ElementType::Node),
            "way" => Some(ElementType::Way),
            "relation" => Some(ElementType::Relation),
            _ => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub member_type: ElementType,
    pub id: i64,
    pub role: String,
}

/// Element-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// Deleted nodes may omit their coordinates.
    Node { lat: Option<f64>, lon: Option<f64> },
    Way { node_refs: Vec<i64> },
    Relation { members: Vec<Member> },
}

impl Element {
    pub fn element_type(&self) -> ElementType {
        match self {
            Element::Node { .. } => ElementType::Node,
            Element::Way { .. } => ElementType::Way,
            Element::Relation { .. } => ElementType::Relation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub action: Action,
    pub id: i64,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub changeset: Option<u64>,
    pub user: Option<String>,
    pub uid: Option<u64>,
    pub tags: BTreeMap<String, String>,
    pub element: Element,
}

impl ChangeRecord {
    pub fn element_type(&self) -> ElementType {
        self.element.element_type()
    }

    pub fn epoch_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}
