//! Hierarchical resource path space.
//!
//! Grounded on `bbque/res/resource_tree.cc` / `include/bbque/res/resource_tree.h`,
//! simplified: rather than a literal
//! tree of nodes, paths are kept in a flat registry and path matching
//! (exact / template / hybrid) is implemented as a single
//! segment-wise comparison. The observable behaviour — three lookup modes,
//! a resource keyed by its full dotted path — is identical; the internal
//! representation is the idiomatic-Rust stand-in.

use std::collections::BTreeMap;

use crate::resources::resource::Resource;

/// Split a path segment like `pe0` into its name (`pe`) and trailing
/// numeric id (`Some(0)`), or `(seg, None)` if the segment has no trailing
/// digits (a template segment, e.g. `pe`).
fn split_segment(seg: &str) -> (&str, Option<u64>) {
    let digit_start = seg
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    if digit_start == seg.len() {
        (seg, None)
    } else {
        let (name, digits) = seg.split_at(digit_start);
        match digits.parse::<u64>() {
            Ok(n) => (name, Some(n)),
            Err(_) => (seg, None),
        }
    }
}

/// Does `query` (possibly a template or hybrid path) match concrete path
/// `candidate`? Segment counts must match; each query segment's name must
/// equal the candidate segment's name; if the query segment carries an
/// explicit numeric id, the candidate's id must match it exactly —
/// otherwise the query segment is a wildcard for that level. Exact
/// match, template match, and hybrid match all fall out of this same
/// rule.
pub fn path_matches(query: &str, candidate: &str) -> bool {
    let q_segs: Vec<&str> = query.split('.').collect();
    let c_segs: Vec<&str> = candidate.split('.').collect();
    if q_segs.len() != c_segs.len() {
        return false;
    }
    for (q, c) in q_segs.iter().zip(c_segs.iter()) {
        let (q_name, q_id) = split_segment(q);
        let (c_name, c_id) = split_segment(c);
        if q_name != c_name {
            return false;
        }
        if let Some(qid) = q_id {
            if c_id != Some(qid) {
                return false;
            }
        }
    }
    true
}

/// Registry of every registered resource leaf, keyed by its full path.
/// Closed for new paths once platform load completes (
/// `RegisterResource`: "After load, the set of paths is closed").
#[derive(Debug, Default)]
pub struct ResourceTree {
    leaves: BTreeMap<String, Resource>,
}

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, total: u64) {
        self.leaves
            .insert(path.to_string(), Resource::new(path, total));
    }

    pub fn get(&self, path: &str) -> Option<&Resource> {
        self.leaves.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Resource> {
        self.leaves.get_mut(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.leaves.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// All registered leaf paths.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.leaves.keys().map(|s| s.as_str())
    }

    /// Exact/template/hybrid lookup: every registered leaf whose path
    /// matches `query` under [`path_matches`]. A fully-concrete `query`
    /// that names a registered leaf returns exactly that one leaf (the
    /// "exact match" mode falls out of the same rule).
    pub fn matching(&self, query: &str) -> Vec<&str> {
        self.leaves
            .keys()
            .filter(|p| path_matches(query, p))
            .map(|s| s.as_str())
            .collect()
    }
}

/// Unit suffix conversion applied at registration ("K/M/G
/// interpreted as 2^10/2^20/2^30").
pub fn convert_units(amount: u64, units: &str) -> u64 {
    match units.to_ascii_lowercase().as_str() {
        "" | "1" | "b" => amount,
        "k" | "kb" => amount.saturating_mul(1 << 10),
        "m" | "mb" => amount.saturating_mul(1 << 20),
        "g" | "gb" => amount.saturating_mul(1 << 30),
        _ => amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(path_matches(
            "arch.tile0.cluster0.pe0",
            "arch.tile0.cluster0.pe0"
        ));
        assert!(!path_matches(
            "arch.tile0.cluster0.pe0",
            "arch.tile0.cluster0.pe1"
        ));
    }

    #[test]
    fn template_match() {
        assert!(path_matches("arch.tile.cluster.pe", "arch.tile0.cluster1.pe3"));
        assert!(path_matches("arch.tile.cluster.pe", "arch.tile9.cluster9.pe9"));
        assert!(!path_matches("arch.tile.cluster.pe", "arch.tile0.cluster1.mem0"));
    }

    #[test]
    fn hybrid_match() {
        assert!(path_matches(
            "arch.tile0.cluster.pe0",
            "arch.tile0.cluster3.pe0"
        ));
        assert!(!path_matches(
            "arch.tile0.cluster.pe0",
            "arch.tile1.cluster3.pe0"
        ));
        assert!(!path_matches(
            "arch.tile0.cluster.pe0",
            "arch.tile0.cluster3.pe1"
        ));
    }

    #[test]
    fn tree_matching_returns_all_leaves() {
        let mut tree = ResourceTree::new();
        tree.insert("arch.tile0.cluster0.pe0", 1);
        tree.insert("arch.tile0.cluster0.pe1", 1);
        tree.insert("arch.tile0.cluster1.pe0", 1);
        let mut m = tree.matching("arch.tile.cluster.pe");
        m.sort();
        assert_eq!(
            m,
            vec![
                "arch.tile0.cluster0.pe0",
                "arch.tile0.cluster0.pe1",
                "arch.tile0.cluster1.pe0",
            ]
        );
    }

    #[test]
    fn unit_conversion() {
        assert_eq!(convert_units(8, "kb"), 8 * 1024);
        assert_eq!(convert_units(2, "mb"), 2 * 1024 * 1024);
        assert_eq!(convert_units(1, "gb"), 1 << 30);
        assert_eq!(convert_units(5, "1"), 5);
    }
}
