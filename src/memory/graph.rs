//! 关系层：记录为节点、relations 为有向边，按关系标签做有界深度 BFS

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::lookup::{default_applies, TierLookup, TierQuery, TierStore, ANY_RELATION};
use super::record::{MemoryRecord, Relation, ScoredRecord, Tier};

#[derive(Default)]
struct Graph {
    nodes: HashMap<String, MemoryRecord>,
}

#[derive(Default)]
pub struct GraphTier {
    graph: RwLock<Graph>,
}

impl GraphTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 seeds 出发沿 relation 边遍历，返回 (记录, 深度)，不含起点本身
    ///
    /// 目标尚未传播到本层的边会被跳过。
    pub fn traverse(&self, seeds: &[String], relation: &str, max_depth: u32) -> Vec<(MemoryRecord, u32)> {
        self.walk(seeds, &[], relation, max_depth)
    }

    /// 同 `traverse`，另外从 `seed_edges`（起点自带的出边）出发；
    /// 起点本身尚未传播到本层时，它的边仍可作为第一跳
    fn walk(
        &self,
        seeds: &[String],
        seed_edges: &[Relation],
        relation: &str,
        max_depth: u32,
    ) -> Vec<(MemoryRecord, u32)> {
        let graph = self.graph.read().unwrap_or_else(PoisonError::into_inner);
        let mut visited: HashSet<&str> = seeds.iter().map(String::as_str).collect();
        let mut queue: VecDeque<(&str, u32)> = seeds.iter().map(|s| (s.as_str(), 0)).collect();
        let mut found = Vec::new();

        if max_depth > 0 {
            for edge in seed_edges {
                if relation != ANY_RELATION && edge.relation != relation {
                    continue;
                }
                let Some(target) = graph.nodes.get(&edge.target) else {
                    continue;
                };
                if visited.insert(target.id.as_str()) {
                    found.push((target.clone(), 1));
                    queue.push_back((target.id.as_str(), 1));
                }
            }
        }

        while let Some((id, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(node) = graph.nodes.get(id) else {
                continue;
            };
            for edge in &node.relations {
                if relation != ANY_RELATION && edge.relation != relation {
                    continue;
                }
                let Some(target) = graph.nodes.get(&edge.target) else {
                    continue;
                };
                if visited.insert(target.id.as_str()) {
                    found.push((target.clone(), depth + 1));
                    queue.push_back((target.id.as_str(), depth + 1));
                }
            }
        }
        found
    }

    pub fn node_count(&self) -> usize {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .len()
    }

    pub fn edge_count(&self) -> usize {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .values()
            .map(|n| n.relations.len())
            .sum()
    }
}

#[async_trait]
impl TierStore for GraphTier {
    fn tier(&self) -> Tier {
        Tier::Graphed
    }

    async fn put(&self, record: &MemoryRecord) -> Result<(), String> {
        let mut graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        graph
            .nodes
            .insert(record.id.clone(), record.resident_in(Tier::Graphed));
        Ok(())
    }

    async fn contains(&self, id: &str) -> bool {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .contains_key(id)
    }

    async fn len(&self) -> usize {
        self.node_count()
    }

    async fn edge_count(&self) -> usize {
        GraphTier::edge_count(self)
    }

    async fn records(&self) -> Vec<MemoryRecord> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .values()
            .cloned()
            .collect()
    }

    async fn clear(&self) {
        self.graph
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .clear();
    }
}

#[async_trait]
impl TierLookup for GraphTier {
    fn tier(&self) -> Tier {
        Tier::Graphed
    }

    fn applies(&self, query: &TierQuery, gathered: &[ScoredRecord]) -> bool {
        default_applies(Tier::Graphed, query, gathered, 1)
    }

    async fn lookup(&self, query: &TierQuery, gathered: &[ScoredRecord]) -> Vec<ScoredRecord> {
        let Some(relation) = query.relation_hint.as_deref() else {
            return Vec::new();
        };
        let mut seeds: Vec<String> = gathered.iter().map(|r| r.record.id.clone()).collect();
        seeds.extend(query.seeds.iter().cloned());
        let seed_edges: Vec<Relation> = gathered
            .iter()
            .flat_map(|r| r.record.relations.iter().cloned())
            .collect();
        self.walk(&seeds, &seed_edges, relation, query.max_depth)
            .into_iter()
            .map(|(record, depth)| ScoredRecord::new(record, Tier::Graphed, 1.0 / (1.0 + depth as f32)))
            .collect()
    }
}
