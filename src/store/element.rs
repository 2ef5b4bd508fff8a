use crate::context::Counters;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;
use uuid::Uuid;

/// Address-space qualified element id, e.g. `c1f3.42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(space: &str, seq: u64) -> Self {
        ElementId(format!("{}.{}", space, seq))
    }

    /// Ids of the standard roots, identical in every address space.
    pub fn well_known(name: &str) -> Self {
        ElementId(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address space that allocated the id.
    pub fn space(&self) -> &str {
        self.0.rsplit_once('.').map(|(space, _)| space).unwrap_or(&self.0)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(raw: &str) -> Self {
        ElementId(raw.to_string())
    }
}

/// Element payload at the API boundary. Always a string on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl ElementValue {
    /// Interprets a wire string, preferring booleans, then integers.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "true" => ElementValue::Boolean(true),
            "false" => ElementValue::Boolean(false),
            _ => raw
                .parse::<i64>()
                .map(ElementValue::Integer)
                .unwrap_or_else(|_| ElementValue::Text(raw.to_string())),
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            ElementValue::Text(s) => s.clone(),
            ElementValue::Integer(i) => i.to_string(),
            ElementValue::Boolean(b) => b.to_string(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ElementValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ElementValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for ElementValue {
    fn from(s: &str) -> Self {
        ElementValue::Text(s.to_string())
    }
}

impl From<String> for ElementValue {
    fn from(s: String) -> Self {
        ElementValue::Text(s)
    }
}

impl From<i64> for ElementValue {
    fn from(i: i64) -> Self {
        ElementValue::Integer(i)
    }
}

impl From<bool> for ElementValue {
    fn from(b: bool) -> Self {
        ElementValue::Boolean(b)
    }
}

/// Addressable attributes of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Id,
    Type,
    Name,
    Value,
    Source,
}

/// Wire form of a single element, never including its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default)]
    pub spirit: bool,
}

pub(crate) struct NodeState {
    pub(crate) kind: String,
    pub(crate) name: String,
    pub(crate) value: String,
    pub(crate) source: String,
    pub(crate) parent: Weak<Node>,
    pub(crate) children: Vec<Element>,
    pub(crate) spirit: bool,
    pub(crate) removed: bool,
    pub(crate) touched: Instant,
}

pub(crate) struct Node {
    pub(crate) id: ElementId,
    pub(crate) owner: Uuid,
    state: RwLock<NodeState>,
    counters: Arc<Counters>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.counters.record_reclaimed();
    }
}

/// Shared handle to a node of the element graph.
///
/// Handles are cheap to clone. Reads never block writers for long; all
/// structural mutation goes through [`crate::store::DataStore`].
#[derive(Clone)]
pub struct Element(pub(crate) Arc<Node>);

impl Element {
    pub(crate) fn new_node(
        id: ElementId,
        owner: Uuid,
        counters: Arc<Counters>,
        kind: &str,
        name: &str,
        value: &str,
        parent: Option<&Element>,
    ) -> Self {
        counters.record_created();
        Element(Arc::new(Node {
            id,
            owner,
            state: RwLock::new(NodeState {
                kind: kind.to_string(),
                name: name.to_string(),
                value: value.to_string(),
                source: String::new(),
                parent: parent.map(|p| Arc::downgrade(&p.0)).unwrap_or_default(),
                children: Vec::new(),
                spirit: false,
                removed: false,
                touched: Instant::now(),
            }),
            counters,
        }))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.0.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.0.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &ElementId {
        &self.0.id
    }

    pub fn kind(&self) -> String {
        self.read().kind.clone()
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn value(&self) -> String {
        self.read().value.clone()
    }

    pub fn typed_value(&self) -> ElementValue {
        ElementValue::from_wire(&self.read().value)
    }

    pub fn source(&self) -> String {
        self.read().source.clone()
    }

    pub fn attribute(&self, attribute: Attribute) -> String {
        let state = self.read();
        match attribute {
            Attribute::Id => self.0.id.to_string(),
            Attribute::Type => state.kind.clone(),
            Attribute::Name => state.name.clone(),
            Attribute::Value => state.value.clone(),
            Attribute::Source => state.source.clone(),
        }
    }

    pub fn is_spirit(&self) -> bool {
        self.read().spirit
    }

    /// True once the element was detached from its store.
    pub fn is_removed(&self) -> bool {
        self.read().removed
    }

    pub fn parent(&self) -> Option<Element> {
        self.read().parent.upgrade().map(Element)
    }

    pub fn children(&self) -> Vec<Element> {
        self.read().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.read().children.len()
    }

    pub fn get(&self, index: usize) -> Option<Element> {
        self.read().children.get(index).cloned()
    }

    /// Children of the given type, in insertion order.
    pub fn children_of_type(&self, kind: &str) -> Vec<Element> {
        self.read()
            .children
            .iter()
            .filter(|c| c.read().kind == kind)
            .cloned()
            .collect()
    }

    pub fn last_touched(&self) -> Instant {
        self.read().touched
    }

    pub fn snapshot(&self) -> ElementSnapshot {
        let state = self.read();
        ElementSnapshot {
            id: self.0.id.clone(),
            kind: state.kind.clone(),
            name: state.name.clone(),
            value: state.value.clone(),
            source: state.source.clone(),
            spirit: state.spirit,
        }
    }

    pub fn ptr_eq(&self, other: &Element) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Element {}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Element")
            .field("id", &self.0.id)
            .field("type", &state.kind)
            .field("name", &state.name)
            .field("value", &state.value)
            .field("spirit", &state.spirit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_values_round_trip_through_wire_strings() {
        assert_eq!(ElementValue::from_wire("true"), ElementValue::Boolean(true));
        assert_eq!(ElementValue::from_wire("-42"), ElementValue::Integer(-42));
        assert_eq!(ElementValue::from_wire("/tmp/x"), ElementValue::Text("/tmp/x".into()));
        assert_eq!(ElementValue::Integer(7).to_wire(), "7");
        assert_eq!(ElementValue::from(false).to_wire(), "false");
    }

    #[test]
    fn id_space_is_prefix() {
        let id = ElementId::new("c4a1", 12);
        assert_eq!(id.as_str(), "c4a1.12");
        assert_eq!(id.space(), "c4a1");
    }

    #[test]
    fn dropping_last_handle_counts_reclaim() {
        let counters = Arc::new(Counters::default());
        let el = Element::new_node(
            ElementId::new("t", 1),
            Uuid::new_v4(),
            counters.clone(),
            "file",
            "a",
            "",
            None,
        );
        let copy = el.clone();
        drop(el);
        assert_eq!(counters.snapshot().reclaimed, 0);
        drop(copy);
        let totals = counters.snapshot();
        assert_eq!(totals.created, 1);
        assert_eq!(totals.reclaimed, 1);
    }
}
