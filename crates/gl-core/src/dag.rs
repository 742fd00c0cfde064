//! Foreign-key DAG that orders table merges.
//!
//! A child table depends on every table its foreign keys reference, so
//! parents always commit before their children are validated.

use crate::error::{CoreError, CoreResult};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Default)]
pub struct TableDag {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
}

impl TableDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, name: &str) -> CoreResult<NodeIndex> {
        if name.is_empty() {
            return Err(CoreError::EmptyName {
                context: "table name in dependency graph".into(),
            });
        }
        if let Some(&idx) = self.node_map.get(name) {
            return Ok(idx);
        }
        let idx = self.graph.add_node(name.to_string());
        self.node_map.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// Record that `child` references `parent`.
    pub fn add_dependency(&mut self, child: &str, parent: &str) -> CoreResult<()> {
        let child_idx = self.add_table(child)?;
        let parent_idx = self.add_table(parent)?;
        self.graph.update_edge(parent_idx, child_idx, ());
        Ok(())
    }

    /// Build from table name -> referenced tables.
    ///
    /// Self references (an employee's manager) and references to tables
    /// outside the map are not ordering constraints and are skipped.
    pub fn build(dependencies: &BTreeMap<String, Vec<String>>) -> CoreResult<Self> {
        let mut dag = Self::new();
        for table in dependencies.keys() {
            dag.add_table(table)?;
        }
        for (table, parents) in dependencies {
            for parent in parents {
                if parent != table && dependencies.contains_key(parent) {
                    dag.add_dependency(table, parent)?;
                }
            }
        }
        dag.validate()?;
        Ok(dag)
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.sorted().map(|_| ())
    }

    fn sorted(&self) -> CoreResult<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| CoreError::CircularDependency {
            cycle: self.find_cycle_path(cycle.node_id()),
        })
    }

    fn find_cycle_path(&self, start: NodeIndex) -> String {
        let mut path = vec![self.graph[start].clone()];
        let mut visited = HashSet::from([start]);
        let mut current = start;
        while let Some(edge) = self.graph.edges(current).next() {
            let target = edge.target();
            path.push(self.graph[target].clone());
            if !visited.insert(target) {
                break;
            }
            current = target;
        }
        path.join(" -> ")
    }

    /// Tables with parents first.
    pub fn topological_order(&self) -> CoreResult<Vec<String>> {
        Ok(self
            .sorted()?
            .into_iter()
            .map(|idx| self.graph[idx].clone())
            .collect())
    }

    /// Group tables into levels: every table's parents sit in an earlier level.
    /// Tables inside one level are sorted by name and may merge concurrently.
    pub fn levels(&self) -> CoreResult<Vec<Vec<String>>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in self.sorted()? {
            let d = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .filter_map(|e| depth.get(&e.source()).map(|p| p + 1))
                .max()
                .unwrap_or(0);
            depth.insert(idx, d);
        }
        let mut levels: Vec<Vec<String>> = Vec::new();
        for (idx, d) in depth {
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(self.graph[idx].clone());
        }
        for level in &mut levels {
            level.sort();
        }
        Ok(levels)
    }

    /// Tables `table` references directly.
    pub fn parents(&self, table: &str) -> Vec<String> {
        let Some(&idx) = self.node_map.get(table) else {
            return Vec::new();
        };
        let mut parents: Vec<String> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| self.graph[e.source()].clone())
            .collect();
        parents.sort();
        parents
    }

    pub fn contains(&self, table: &str) -> bool {
        self.node_map.contains_key(table)
    }
}
