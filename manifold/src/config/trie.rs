//! Reverse-label domain trie.
//!
//! Maps dotted-label domains to values, indexed right-to-left so that
//! `api.app.com` is stored under the path `com -> app -> api`. A `*` label
//! matches any single label during lookup, with exact labels taking
//! precedence. Lookups are concurrent with the rare writes (startup load,
//! reload) through a reader-writer lock at the root.

use std::collections::HashMap;
use std::sync::RwLock;

struct Node<T> {
    children: HashMap<String, Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            value: None,
        }
    }
}

/// A trie keyed by DNS labels read right-to-left.
pub struct DomainTrie<T> {
    root: RwLock<Node<T>>,
}

impl<T> Default for DomainTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DomainTrie<T> {
    /// Creates an empty trie.
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::new()),
        }
    }

    /// Stores a value for the given domain, creating missing nodes.
    ///
    /// Labels are compared case-insensitively; the domain is lowercased on
    /// insertion. A `*` label stores a wildcard node at that level.
    pub fn set(&self, domain: &str, value: T) {
        let mut root = self.root.write().expect("trie lock poisoned");
        let mut node = &mut *root;

        for label in Self::labels(domain) {
            node = node.children.entry(label).or_insert_with(Node::new);
        }

        node.value = Some(value);
    }

    /// Walks the labels of `domain` right-to-left, falling back to a `*`
    /// child whenever the exact label is absent. Returns the value only if
    /// the full label sequence lands on a node that carries one.
    pub fn get(&self, domain: &str) -> Option<T>
    where
        T: Clone,
    {
        let root = self.root.read().expect("trie lock poisoned");
        let mut node = &*root;

        for label in Self::labels(domain) {
            node = match node.children.get(&label) {
                Some(exact) => exact,
                None => node.children.get("*")?,
            };
        }

        node.value.clone()
    }

    /// Removes the value stored for `domain`. Returns true if a value was
    /// present. Nodes left childless and valueless are detached, collapsing
    /// the chain upward until a node with siblings, children, or a value
    /// remains. Wildcards are not consulted: deletion is exact.
    pub fn delete(&self, domain: &str) -> bool {
        let labels: Vec<String> = Self::labels(domain).collect();
        let mut root = self.root.write().expect("trie lock poisoned");
        Self::delete_in(&mut root, &labels).is_some()
    }

    // Returns None if the path does not exist or carried no value, and
    // Some(prune) otherwise, where prune asks the parent to drop the child.
    fn delete_in(node: &mut Node<T>, labels: &[String]) -> Option<bool> {
        let Some((label, rest)) = labels.split_first() else {
            node.value.take()?;
            return Some(node.children.is_empty());
        };

        let child = node.children.get_mut(label)?;
        let prune = Self::delete_in(child, rest)?;
        if prune {
            node.children.remove(label);
        }
        Some(node.value.is_none() && node.children.is_empty())
    }

    /// Returns all domains with a stored value, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        let root = self.root.read().expect("trie lock poisoned");
        let mut result = Vec::new();
        Self::collect_keys(&root, &mut Vec::new(), &mut result);
        result
    }

    fn collect_keys<'a>(node: &'a Node<T>, path: &mut Vec<&'a str>, result: &mut Vec<String>) {
        if node.value.is_some() {
            // Labels were pushed root-first (TLD first); a domain reads
            // leaf-first.
            let domain: Vec<&str> = path.iter().rev().copied().collect();
            result.push(domain.join("."));
        }

        for (label, child) in &node.children {
            path.push(label);
            Self::collect_keys(child, path, result);
            path.pop();
        }
    }

    /// Returns true if the trie holds no values.
    pub fn is_empty(&self) -> bool {
        let root = self.root.read().expect("trie lock poisoned");
        root.value.is_none() && root.children.is_empty()
    }

    fn labels(domain: &str) -> impl Iterator<Item = String> + '_ {
        domain.split('.').rev().map(|l| l.to_ascii_lowercase())
    }
}
