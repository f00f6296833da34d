//! Periodic node constraints.
//!
//! The driving application passes periodic node pairs each step. Pairs are closed
//! transitively (a corner node may be constrained to three others) with a small
//! union-find, then stored as `node → sorted partners` for ancestry expansion.

use crate::topology::entity::EntityId;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct UnionFind {
    parent: BTreeMap<EntityId, EntityId>,
}

impl UnionFind {
    fn root(&mut self, node: EntityId) -> EntityId {
        let parent = *self.parent.entry(node).or_insert(node);
        if parent == node {
            return node;
        }
        let root = self.root(parent);
        self.parent.insert(node, root);
        root
    }

    fn union(&mut self, a: EntityId, b: EntityId) {
        let (ra, rb) = (self.root(a), self.root(b));
        if ra != rb {
            // smaller id wins so classes are independent of pair order
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(hi, lo);
        }
    }
}

/// Constrained (periodic) node partners.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeriodicNodeMap {
    partners: BTreeMap<EntityId, Vec<EntityId>>,
}

impl PeriodicNodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from unordered node pairs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (EntityId, EntityId)>,
    {
        let mut uf = UnionFind::default();
        for (a, b) in pairs {
            uf.union(a, b);
        }
        let nodes: Vec<EntityId> = uf.parent.keys().copied().collect();
        let mut classes: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
        for n in nodes {
            let r = uf.root(n);
            classes.entry(r).or_default().push(n);
        }
        let mut partners = BTreeMap::new();
        for members in classes.into_values() {
            for &n in &members {
                let others: Vec<EntityId> = members.iter().copied().filter(|&m| m != n).collect();
                if !others.is_empty() {
                    partners.insert(n, others);
                }
            }
        }
        Self { partners }
    }

    pub fn is_empty(&self) -> bool {
        self.partners.is_empty()
    }

    /// Sorted partners of `node` (empty if unconstrained).
    pub fn partners(&self, node: EntityId) -> &[EntityId] {
        self.partners.get(&node).map_or(&[], Vec::as_slice)
    }

    pub fn is_constrained(&self, node: EntityId) -> bool {
        self.partners.contains_key(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &[EntityId])> + '_ {
        self.partners.iter().map(|(k, v)| (*k, v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> EntityId {
        EntityId::new(n).unwrap()
    }

    #[test]
    fn pairs_close_transitively() {
        let map = PeriodicNodeMap::from_pairs([(id(1), id(5)), (id(9), id(5)), (id(2), id(3))]);
        assert_eq!(map.partners(id(1)), &[id(5), id(9)]);
        assert_eq!(map.partners(id(9)), &[id(1), id(5)]);
        assert_eq!(map.partners(id(3)), &[id(2)]);
        assert!(map.partners(id(4)).is_empty());
        assert!(!map.is_constrained(id(4)));
    }

    #[test]
    fn pair_order_is_irrelevant() {
        let a = PeriodicNodeMap::from_pairs([(id(7), id(2)), (id(2), id(4))]);
        let b = PeriodicNodeMap::from_pairs([(id(4), id(2)), (id(2), id(7))]);
        assert_eq!(a, b);
    }
}
