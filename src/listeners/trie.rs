//! Wildcard path trie.
//!
//! Listener ids live at the leaf reached by walking a 0-3 slot path of
//! identifiers, where any slot may be a wildcard. Broadcast walks both the
//! exact branch and the wildcard branch at every position, so a concrete
//! path reaches the cross-product of matching leaves.

use super::ListenerId;
use crate::types::Id;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub(crate) struct TrieNode {
    /// Listeners whose registered path ends at this node.
    listeners: Vec<ListenerId>,
    /// Exact-id branches.
    children: BTreeMap<Id, TrieNode>,
    /// The any-id branch for this position.
    wildcard: Option<Box<TrieNode>>,
}

impl TrieNode {
    /// Insert `id` at the leaf addressed by `path`, creating intermediate
    /// nodes on demand. `None` slots take the wildcard branch.
    pub fn insert(&mut self, path: &[Option<Id>], id: ListenerId) {
        match path.split_first() {
            None => {
                if !self.listeners.contains(&id) {
                    self.listeners.push(id);
                }
            }
            Some((None, rest)) => self
                .wildcard
                .get_or_insert_with(Default::default)
                .insert(rest, id),
            Some((Some(seg), rest)) => self
                .children
                .entry(seg.clone())
                .or_default()
                .insert(rest, id),
        }
    }

    /// Remove `id` from the leaf addressed by `path`, pruning intermediate
    /// nodes left empty. Returns true if this node itself is now empty.
    pub fn remove(&mut self, path: &[Option<Id>], id: ListenerId) -> bool {
        match path.split_first() {
            None => self.listeners.retain(|l| *l != id),
            Some((None, rest)) => {
                if let Some(node) = self.wildcard.as_mut() {
                    if node.remove(rest, id) {
                        self.wildcard = None;
                    }
                }
            }
            Some((Some(seg), rest)) => {
                if let Some(node) = self.children.get_mut(seg) {
                    if node.remove(rest, id) {
                        self.children.remove(seg);
                    }
                }
            }
        }
        self.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.children.is_empty() && self.wildcard.is_none()
    }

    /// Collect every listener reachable from a concrete path by trying the
    /// exact id and the wildcard branch at each position.
    pub fn collect(&self, path: &[&str], out: &mut Vec<ListenerId>) {
        match path.split_first() {
            None => out.extend(self.listeners.iter().copied()),
            Some((seg, rest)) => {
                if let Some(node) = self.children.get(*seg) {
                    node.collect(rest, out);
                }
                if let Some(node) = self.wildcard.as_deref() {
                    node.collect(rest, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(slots: &[Option<&str>]) -> Vec<Option<Id>> {
        slots.iter().map(|s| s.map(str::to_owned)).collect()
    }

    fn collected(root: &TrieNode, concrete: &[&str]) -> Vec<ListenerId> {
        let mut out = Vec::new();
        root.collect(concrete, &mut out);
        out
    }

    #[test]
    fn test_exact_and_wildcard_both_match() {
        let mut root = TrieNode::default();
        root.insert(&path(&[Some("pets"), Some("fido")]), ListenerId(1));
        root.insert(&path(&[Some("pets"), None]), ListenerId(2));
        root.insert(&path(&[None, None]), ListenerId(3));
        root.insert(&path(&[Some("cars"), None]), ListenerId(4));

        let hits = collected(&root, &["pets", "fido"]);
        assert_eq!(hits, vec![ListenerId(1), ListenerId(2), ListenerId(3)]);

        let hits = collected(&root, &["pets", "rex"]);
        assert_eq!(hits, vec![ListenerId(2), ListenerId(3)]);

        let hits = collected(&root, &["cars", "beetle"]);
        assert_eq!(hits, vec![ListenerId(4), ListenerId(3)]);
    }

    #[test]
    fn test_zero_length_path() {
        let mut root = TrieNode::default();
        root.insert(&[], ListenerId(7));
        assert_eq!(collected(&root, &[]), vec![ListenerId(7)]);
    }

    #[test]
    fn test_remove_prunes_empty_branches() {
        let mut root = TrieNode::default();
        root.insert(&path(&[Some("pets"), None, Some("legs")]), ListenerId(1));
        assert!(!root.is_empty());

        root.remove(&path(&[Some("pets"), None, Some("legs")]), ListenerId(1));
        assert!(root.is_empty());
        assert!(collected(&root, &["pets", "fido", "legs"]).is_empty());
    }

    #[test]
    fn test_remove_keeps_siblings() {
        let mut root = TrieNode::default();
        root.insert(&path(&[Some("pets"), Some("fido")]), ListenerId(1));
        root.insert(&path(&[Some("pets"), Some("rex")]), ListenerId(2));

        root.remove(&path(&[Some("pets"), Some("fido")]), ListenerId(1));
        assert!(!root.is_empty());
        assert_eq!(collected(&root, &["pets", "rex"]), vec![ListenerId(2)]);
    }
}
