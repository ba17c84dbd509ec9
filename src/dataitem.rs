//! Generic self-describing key/value tree returned by every backend.
//!
//! Every backend (`hostapd`, `netlink`, `vendor`) hands its caller a tree of
//! [`DataItem`] nodes rather than a protocol-specific struct, so the DCS core
//! never needs to know which transport produced a response or event. A node
//! owns its children directly (`Vec<DataItem>`); the "successor pointer
//! forming a sibling sequence" of the distilled design becomes plain `Vec`
//! ordering, and freeing a tree is just `Drop` — no manual teardown routine.

use std::fmt;

/// A node's key: either a textual name (hostapd `key=value` lines, vendor
/// field names) or a 32-bit integer (netlink attribute/command identifiers).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Str(String),
    Id(u32),
}

impl ItemKey {
    pub fn str(s: impl Into<String>) -> Self {
        ItemKey::Str(s.into())
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Str(s) => write!(f, "{s}"),
            ItemKey::Id(id) => write!(f, "#{id}"),
        }
    }
}

impl From<&str> for ItemKey {
    fn from(s: &str) -> Self {
        ItemKey::Str(s.to_string())
    }
}

impl From<u32> for ItemKey {
    fn from(id: u32) -> Self {
        ItemKey::Id(id)
    }
}

/// One node of the tree: a key, an optional opaque byte value, and an
/// ordered list of children. A node with children and no value is a pure
/// grouping node (e.g. the synthetic root returned by `submit_blocking`); a
/// node with a value and no children is a leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataItem {
    pub key: ItemKey,
    pub value: Option<Vec<u8>>,
    pub children: Vec<DataItem>,
}

impl Default for ItemKey {
    fn default() -> Self {
        ItemKey::Id(0)
    }
}

impl DataItem {
    pub fn leaf(key: impl Into<ItemKey>, value: impl Into<Vec<u8>>) -> Self {
        DataItem {
            key: key.into(),
            value: Some(value.into()),
            children: Vec::new(),
        }
    }

    pub fn node(key: impl Into<ItemKey>, children: Vec<DataItem>) -> Self {
        DataItem {
            key: key.into(),
            value: None,
            children,
        }
    }

    pub fn empty(key: impl Into<ItemKey>) -> Self {
        DataItem {
            key: key.into(),
            value: None,
            children: Vec::new(),
        }
    }

    pub fn value_str(&self) -> Option<&str> {
        self.value.as_deref().and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn push(&mut self, child: DataItem) {
        self.children.push(child);
    }

    /// Find the first sibling in `siblings` whose key matches `key`.
    pub fn find_sibling<'a>(siblings: &'a [DataItem], key: &ItemKey) -> Option<&'a DataItem> {
        siblings.iter().find(|item| &item.key == key)
    }

    /// Descend through nested children following a variadic path of `u32`
    /// keys, e.g. `find_child_chain(&[NL80211_ATTR_WIPHY, NESTED_IDX])`.
    pub fn find_child_chain(&self, path: &[u32]) -> Option<&DataItem> {
        let mut cur = self;
        for &id in path {
            cur = cur.children.iter().find(|c| c.key == ItemKey::Id(id))?;
        }
        Some(cur)
    }

    /// The `n`th sibling (0-indexed) in an ordered sequence.
    pub fn nth_sibling(siblings: &[DataItem], n: usize) -> Option<&DataItem> {
        siblings.get(n)
    }

    /// Test whether a string value contains a bracketed flag token, as used
    /// by hostapd's `flags=[AUTH][ASSOC]` STATUS field.
    pub fn has_flag(value: &str, flag: &str) -> bool {
        let token = format!("[{flag}]");
        value.contains(&token)
    }

    /// `true` if this node or any of its immediate children carry `key` —
    /// the match rule the async dispatcher (§4.F) uses to route an event to
    /// registered pattern monitors.
    pub fn matches(&self, key: &ItemKey) -> bool {
        &self.key == key || self.children.iter().any(|c| &c.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_sibling_by_key() {
        let siblings = vec![
            DataItem::leaf("freq", b"915000".to_vec()),
            DataItem::leaf("bandwidth", b"4".to_vec()),
        ];
        let found = DataItem::find_sibling(&siblings, &ItemKey::str("bandwidth")).unwrap();
        assert_eq!(found.value_str(), Some("4"));
        assert!(DataItem::find_sibling(&siblings, &ItemKey::str("missing")).is_none());
    }

    #[test]
    fn nested_child_chain() {
        let tree = DataItem::node(
            1u32,
            vec![DataItem::node(2u32, vec![DataItem::leaf(3u32, b"x".to_vec())])],
        );
        assert!(tree.find_child_chain(&[2, 3]).is_some());
        assert!(tree.find_child_chain(&[2, 4]).is_none());
        assert!(tree.find_child_chain(&[9]).is_none());
    }

    #[test]
    fn nth_sibling_bounds() {
        let siblings = vec![DataItem::empty("a"), DataItem::empty("b")];
        assert_eq!(DataItem::nth_sibling(&siblings, 1).unwrap().key, ItemKey::str("b"));
        assert!(DataItem::nth_sibling(&siblings, 5).is_none());
    }

    #[test]
    fn bracketed_flag_membership() {
        let flags = "[AUTH][ASSOC]";
        assert!(DataItem::has_flag(flags, "AUTH"));
        assert!(DataItem::has_flag(flags, "ASSOC"));
        assert!(!DataItem::has_flag(flags, "AUTHORIZED"));
    }

    #[test]
    fn drop_releases_whole_tree() {
        let tree = DataItem::node(
            "root",
            vec![DataItem::leaf("a", b"1".to_vec()), DataItem::leaf("b", b"2".to_vec())],
        );
        drop(tree);
    }
}
