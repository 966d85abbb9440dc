//! # Named Sets
//!
//! Policies refer to sets by name (`PUSH_SET nets`). The interpreter resolves
//! names through a `SetProvider`; `SetManager` is the in-memory table the
//! policy filter owns and replaces copy-on-write.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::element::Element;

/// Resolves set names to elements
pub trait SetProvider {
    /// Returns the set registered under `name`, if any
    fn get_set(&self, name: &str) -> Option<&Element>;
}

impl SetProvider for HashMap<String, Element> {
    fn get_set(&self, name: &str) -> Option<&Element> {
        self.get(name)
    }
}

/// Table of named sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetManager {
    sets: HashMap<String, Element>,
}

impl SetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a set (builder style)
    pub fn with_set(mut self, name: impl Into<String>, value: Element) -> Self {
        self.sets.insert(name.into(), value);
        self
    }

    /// Registers or replaces a set, returning the previous value
    pub fn update(&mut self, name: impl Into<String>, value: Element) -> Option<Element> {
        self.sets.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Element> {
        self.sets.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl SetProvider for SetManager {
    fn get_set(&self, name: &str) -> Option<&Element> {
        self.sets.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ElementFactory;

    #[test]
    fn update_and_lookup() {
        let nets = ElementFactory::create("set_ipv4net", Some("10.0.0.0/8")).unwrap();
        let mut sets = SetManager::new().with_set("nets", nets.clone());
        assert_eq!(sets.get_set("nets"), Some(&nets));
        assert_eq!(sets.get_set("missing"), None);

        let wider = ElementFactory::create("set_ipv4net", Some("10.0.0.0/8,172.16.0.0/12")).unwrap();
        assert_eq!(sets.update("nets", wider.clone()), Some(nets));
        sets.update("tags", ElementFactory::create("set_u32", Some("1")).unwrap());
        assert_eq!(sets.names(), vec!["nets", "tags"]);
        assert_eq!(sets.get_set("nets"), Some(&wider));

        assert!(sets.remove("tags").is_some());
        assert!(!sets.contains("tags"));
        assert_eq!(sets.len(), 1);
    }

    #[test]
    fn loads_from_json() {
        let json = r#"{"asns":{"type":"set","value":{"member":"u32","items":[
            {"type":"u32","value":65001}]}}}"#;
        let sets: SetManager = serde_json::from_str(json).unwrap();
        assert_eq!(sets.get_set("asns").unwrap().str(), "65001");
    }
}
