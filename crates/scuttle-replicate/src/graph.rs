//! The trust graph.
//!
//! Materialized from the contacts edge table into a contiguous vertex
//! array with adjacency lists and a `(src, dst) → latest edge` side
//! table; BFS operates on indices. Blocks override follows: a feed the
//! start blocks is never yielded, regardless of path.

use std::collections::{HashMap, HashSet, VecDeque};

use scuttle_index::{ContactsStore, EdgeKind};
use scuttle_types::{FeedRef, Result};

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// An immutable snapshot of the trust graph.
pub struct Graph {
    nodes: Vec<FeedRef>,
    index: HashMap<FeedRef, usize>,
    follows: Vec<Vec<usize>>,
    latest: HashMap<(usize, usize), EdgeKind>,
}

impl Graph {
    fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            follows: Vec::new(),
            latest: HashMap::new(),
        }
    }

    /// Feeds within `max` follow-hops of `from`, excluding feeds `from`
    /// blocks. The start feed itself is included at distance zero.
    pub fn hops(&self, from: &FeedRef, max: u32) -> HashSet<FeedRef> {
        let mut out = HashSet::new();
        out.insert(*from);

        let Some(&start) = self.index.get(from) else {
            return out;
        };
        let blocked = self.blocked_indices(start);

        let mut dist = vec![u32::MAX; self.nodes.len()];
        let mut queue = VecDeque::new();
        dist[start] = 0;
        queue.push_back(start);

        while let Some(node) = queue.pop_front() {
            if dist[node] >= max {
                continue;
            }
            for &next in &self.follows[node] {
                if dist[next] != u32::MAX || blocked.contains(&next) {
                    continue;
                }
                dist[next] = dist[node] + 1;
                out.insert(self.nodes[next]);
                queue.push_back(next);
            }
        }
        out
    }

    /// Feeds `from` currently blocks.
    pub fn blocks(&self, from: &FeedRef) -> HashSet<FeedRef> {
        let Some(&start) = self.index.get(from) else {
            return HashSet::new();
        };
        self.blocked_indices(start)
            .into_iter()
            .map(|i| self.nodes[i])
            .collect()
    }

    /// True if the latest edge from `a` to `b` is a follow.
    pub fn is_following(&self, a: &FeedRef, b: &FeedRef) -> bool {
        self.edge(a, b) == Some(EdgeKind::Follow)
    }

    /// True if the latest edge from `a` to `b` is a block.
    pub fn is_blocking(&self, a: &FeedRef, b: &FeedRef) -> bool {
        self.edge(a, b) == Some(EdgeKind::Block)
    }

    fn edge(&self, a: &FeedRef, b: &FeedRef) -> Option<EdgeKind> {
        let a = *self.index.get(a)?;
        let b = *self.index.get(b)?;
        self.latest.get(&(a, b)).copied()
    }

    fn blocked_indices(&self, start: usize) -> HashSet<usize> {
        self.latest
            .iter()
            .filter(|((src, _), kind)| *src == start && **kind == EdgeKind::Block)
            .map(|((_, dst), _)| *dst)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

/// Builds graph snapshots from the contacts index.
#[derive(Clone)]
pub struct GraphBuilder {
    contacts: ContactsStore,
}

impl GraphBuilder {
    /// Creates a builder over the contacts edge table.
    pub fn new(contacts: ContactsStore) -> Self {
        Self { contacts }
    }

    /// Materializes the current graph.
    pub fn build(&self) -> Result<Graph> {
        let edges = self.contacts.all_edges()?;
        if edges.is_empty() {
            return Ok(Graph::empty());
        }

        let mut graph = Graph::empty();
        for (src, dst, kind) in edges {
            let s = intern(&mut graph, src);
            let d = intern(&mut graph, dst);
            graph.latest.insert((s, d), kind);
        }
        for ((src, dst), kind) in graph.latest.clone() {
            if kind == EdgeKind::Follow {
                graph.follows[src].push(dst);
            }
        }
        Ok(graph)
    }

    /// Convenience: hops over a freshly built snapshot.
    pub fn hops(&self, from: &FeedRef, max: u32) -> Result<HashSet<FeedRef>> {
        Ok(self.build()?.hops(from, max))
    }
}

fn intern(graph: &mut Graph, feed: FeedRef) -> usize {
    if let Some(&i) = graph.index.get(&feed) {
        return i;
    }
    let i = graph.nodes.len();
    graph.nodes.push(feed);
    graph.follows.push(Vec::new());
    graph.index.insert(feed, i);
    i
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use scuttle_crypto::signing::KeyPair;

    fn feed(seed: u8) -> FeedRef {
        KeyPair::from_seed(&[seed; 32]).id()
    }

    fn builder() -> (tempfile::TempDir, ContactsStore, GraphBuilder) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = sled::open(dir.path().join("indexes")).expect("sled");
        let store = ContactsStore::open(&db).expect("store");
        let builder = GraphBuilder::new(store.clone());
        (dir, store, builder)
    }

    #[test]
    fn hops_walks_follow_chain() -> Result<()> {
        let (_dir, store, builder) = builder();
        let (a, b, c, d) = (feed(1), feed(2), feed(3), feed(4));
        store.set_edge(&a, &b, EdgeKind::Follow)?;
        store.set_edge(&b, &c, EdgeKind::Follow)?;
        store.set_edge(&c, &d, EdgeKind::Follow)?;

        let within_two = builder.hops(&a, 2)?;
        assert!(within_two.contains(&a));
        assert!(within_two.contains(&b));
        assert!(within_two.contains(&c));
        assert!(!within_two.contains(&d));
        Ok(())
    }

    #[test]
    fn blocks_exclude_from_hops() -> Result<()> {
        let (_dir, store, builder) = builder();
        let (a, b, c) = (feed(1), feed(2), feed(3));
        store.set_edge(&a, &b, EdgeKind::Follow)?;
        store.set_edge(&b, &c, EdgeKind::Follow)?;
        store.set_edge(&a, &c, EdgeKind::Block)?;

        let hops = builder.hops(&a, 3)?;
        assert!(hops.contains(&b));
        assert!(!hops.contains(&c), "blocked feeds never enter the want set");

        let graph = builder.build()?;
        assert_eq!(graph.blocks(&a), [c].into_iter().collect());
        Ok(())
    }

    #[test]
    fn latest_edge_wins() -> Result<()> {
        let (_dir, store, builder) = builder();
        let (a, b) = (feed(1), feed(2));
        store.set_edge(&a, &b, EdgeKind::Follow)?;
        store.set_edge(&a, &b, EdgeKind::Unfollow)?;

        let graph = builder.build()?;
        assert!(!graph.is_following(&a, &b));
        assert!(!graph.hops(&a, 2).contains(&b));
        Ok(())
    }

    #[test]
    fn is_following_and_blocking_queries() -> Result<()> {
        let (_dir, store, builder) = builder();
        let (a, b, c) = (feed(1), feed(2), feed(3));
        store.set_edge(&a, &b, EdgeKind::Follow)?;
        store.set_edge(&a, &c, EdgeKind::Block)?;

        let graph = builder.build()?;
        assert!(graph.is_following(&a, &b));
        assert!(!graph.is_following(&b, &a));
        assert!(graph.is_blocking(&a, &c));
        assert!(!graph.is_blocking(&a, &b));
        Ok(())
    }

    #[test]
    fn cycles_terminate() -> Result<()> {
        let (_dir, store, builder) = builder();
        let (a, b) = (feed(1), feed(2));
        store.set_edge(&a, &b, EdgeKind::Follow)?;
        store.set_edge(&b, &a, EdgeKind::Follow)?;

        let hops = builder.hops(&a, 10)?;
        assert_eq!(hops.len(), 2);
        Ok(())
    }

    #[test]
    fn empty_graph_yields_only_self() -> Result<()> {
        let (_dir, _store, builder) = builder();
        let a = feed(1);
        assert_eq!(builder.hops(&a, 2)?, [a].into_iter().collect());
        Ok(())
    }
}
