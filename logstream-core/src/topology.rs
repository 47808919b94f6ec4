//! The processing graph: computations connected through the streams they read and write.
//!
//! A topology is declared once and then shared by the processors built from it:
//!
//! ```text
//! Topology::builder()
//!     .add_computation(source, &["o1:s1"])
//!     .add_computation(map, &["i1:s1", "o1:s2"])
//!     .build()?
//! ```
//!
//! Every `logical:physical` pair binds a stream of the computation (`i1`, `o1`, ...) to a
//! physical stream. The computation graph must be acyclic.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::Error;
use crate::Result;
use crate::computation::{ComputationMetadataMapping, ComputationSupplier};

#[derive(Clone)]
struct Node {
    metadata: Arc<ComputationMetadataMapping>,
    supplier: ComputationSupplier,
    /// indexes of the computations reading an output stream of this one
    downstream: BTreeSet<usize>,
    upstream: BTreeSet<usize>,
}

#[derive(Default)]
pub struct TopologyBuilder {
    declarations: Vec<(ComputationSupplier, Vec<String>)>,
}

impl TopologyBuilder {
    pub fn add_computation(mut self, supplier: ComputationSupplier, mapping: &[&str]) -> Self {
        self.declarations
            .push((supplier, mapping.iter().map(|m| m.to_string()).collect()));
        self
    }

    pub fn build(self) -> Result<Topology> {
        let mut nodes: Vec<Node> = Vec::with_capacity(self.declarations.len());
        let mut names = HashMap::new();
        for (supplier, mapping) in self.declarations {
            let metadata = supplier().metadata().clone();
            let mapping = parse_mapping(metadata.name(), &mapping)?;
            let mapped = ComputationMetadataMapping::new(&metadata, &mapping)?;
            if names.insert(mapped.name().to_string(), nodes.len()).is_some() {
                return Err(Error::Config(format!(
                    "computation {} is declared twice",
                    mapped.name()
                )));
            }
            nodes.push(Node {
                metadata: Arc::new(mapped),
                supplier,
                downstream: BTreeSet::new(),
                upstream: BTreeSet::new(),
            });
        }

        // stream -> readers
        let mut readers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            for stream in node.metadata.input_streams() {
                readers.entry(stream.as_str()).or_default().push(idx);
            }
        }
        let mut edges = vec![];
        for (idx, node) in nodes.iter().enumerate() {
            for stream in node.metadata.output_streams() {
                for reader in readers.get(stream.as_str()).into_iter().flatten() {
                    edges.push((idx, *reader));
                }
            }
        }
        for (from, to) in edges {
            if let Some(node) = nodes.get_mut(from) {
                node.downstream.insert(to);
            }
            if let Some(node) = nodes.get_mut(to) {
                node.upstream.insert(from);
            }
        }

        let order = topological_order(&nodes)?;
        Ok(Topology {
            nodes,
            names,
            order,
        })
    }
}

fn parse_mapping(computation: &str, mapping: &[String]) -> Result<HashMap<String, String>> {
    let mut parsed = HashMap::new();
    for entry in mapping {
        let Some((logical, physical)) = entry.split_once(':') else {
            return Err(Error::Config(format!(
                "invalid stream mapping {entry} for computation {computation}, expecting logical:physical"
            )));
        };
        if logical.is_empty() || physical.is_empty() {
            return Err(Error::Config(format!(
                "invalid stream mapping {entry} for computation {computation}"
            )));
        }
        parsed.insert(logical.to_string(), physical.to_string());
    }
    Ok(parsed)
}

/// Kahn's algorithm, ties broken by declaration order.
fn topological_order(nodes: &[Node]) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.upstream.len()).collect();
    let mut ready: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(idx) = ready.pop_front() {
        order.push(idx);
        let Some(node) = nodes.get(idx) else {
            continue;
        };
        for next in &node.downstream {
            if let Some(degree) = in_degree.get_mut(*next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*next);
                }
            }
        }
    }
    if order.len() != nodes.len() {
        let cycle: Vec<&str> = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| !order.contains(i))
            .map(|(_, n)| n.metadata.name())
            .collect();
        return Err(Error::Config(format!(
            "topology has a cycle between computations {cycle:?}"
        )));
    }
    Ok(order)
}

/// Immutable once built, cloning is cheap enough to hand a copy to every processor.
#[derive(Clone)]
pub struct Topology {
    nodes: Vec<Node>,
    names: HashMap<String, usize>,
    /// topological order of the computations
    order: Vec<usize>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    fn node(&self, name: &str) -> Option<&Node> {
        self.names.get(name).and_then(|idx| self.nodes.get(*idx))
    }

    fn ordered(&self, selected: &BTreeSet<usize>) -> Vec<&str> {
        self.order
            .iter()
            .filter(|idx| selected.contains(idx))
            .filter_map(|idx| self.nodes.get(*idx))
            .map(|n| n.metadata.name())
            .collect()
    }

    fn walk(&self, name: &str, next: impl Fn(&Node) -> &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let Some(start) = self.names.get(name) else {
            return seen;
        };
        let mut queue = VecDeque::from([*start]);
        while let Some(idx) = queue.pop_front() {
            let Some(node) = self.nodes.get(idx) else {
                continue;
            };
            for n in next(node) {
                if seen.insert(*n) {
                    queue.push_back(*n);
                }
            }
        }
        seen.remove(start);
        seen
    }

    pub fn metadata(&self, computation: &str) -> Option<Arc<ComputationMetadataMapping>> {
        self.node(computation).map(|n| Arc::clone(&n.metadata))
    }

    pub fn supplier(&self, computation: &str) -> Option<ComputationSupplier> {
        self.node(computation).map(|n| Arc::clone(&n.supplier))
    }

    /// Computation names in topological order.
    pub fn computations(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter_map(|idx| self.nodes.get(*idx))
            .map(|n| n.metadata.name())
            .collect()
    }

    /// Every physical stream read or written by a computation.
    pub fn streams(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.metadata
                    .input_streams()
                    .iter()
                    .chain(n.metadata.output_streams().iter())
            })
            .map(String::as_str)
            .collect()
    }

    /// Computations not fed by another computation.
    pub fn roots(&self) -> Vec<&str> {
        let roots: BTreeSet<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.upstream.is_empty())
            .map(|(i, _)| i)
            .collect();
        self.ordered(&roots)
    }

    /// Computations reachable downstream, in topological order, `computation` excluded.
    pub fn descendant_computations(&self, computation: &str) -> Vec<&str> {
        self.ordered(&self.walk(computation, |n| &n.downstream))
    }

    /// Computations feeding `computation` directly or not, in topological order.
    pub fn ancestor_computations(&self, computation: &str) -> Vec<&str> {
        self.ordered(&self.walk(computation, |n| &n.upstream))
    }

    pub fn to_plantuml(&self) -> String {
        let mut uml = String::from("@startuml\n");
        for stream in self.streams() {
            uml.push_str(&format!("queue {stream}\n"));
        }
        for name in self.computations() {
            let Some(node) = self.node(name) else {
                continue;
            };
            uml.push_str(&format!("node {name}\n"));
            for stream in node.metadata.input_streams() {
                uml.push_str(&format!("{stream} ==> {name}\n"));
            }
            for stream in node.metadata.output_streams() {
                uml.push_str(&format!("{name} ==> {stream}\n"));
            }
        }
        uml.push_str("@enduml\n");
        uml
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let computations = self
            .order
            .iter()
            .filter_map(|i| self.nodes.get(*i))
            .map(|n| n.metadata.to_string());
        f.debug_list().entries(computations).finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::computation::{
        Computation, ComputationBase, ComputationContext, ComputationMetadata,
    };
    use crate::record::Record;

    struct Noop(ComputationBase);

    #[async_trait]
    impl Computation for Noop {
        fn metadata(&self) -> &ComputationMetadata {
            self.0.metadata()
        }

        async fn process_record(
            &mut self,
            _context: &mut ComputationContext,
            _input_stream: &str,
            _record: Record,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn supplier(name: &'static str, inputs: usize, outputs: usize) -> ComputationSupplier {
        Arc::new(move || -> Box<dyn Computation> {
            Box::new(Noop(ComputationBase::new(name, inputs, outputs).unwrap()))
        })
    }

    fn diamond() -> Topology {
        Topology::builder()
            .add_computation(supplier("sink", 2, 0), &["i1:s2", "i2:s3"])
            .add_computation(supplier("left", 1, 1), &["i1:s1", "o1:s2"])
            .add_computation(supplier("source", 0, 1), &["o1:s1"])
            .add_computation(supplier("right", 1, 1), &["i1:s1", "o1:s3"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_order_and_walks() {
        let topology = diamond();
        assert_eq!(topology.computations(), vec!["source", "left", "right", "sink"]);
        assert_eq!(topology.roots(), vec!["source"]);
        assert_eq!(
            topology.descendant_computations("source"),
            vec!["left", "right", "sink"]
        );
        assert_eq!(topology.descendant_computations("left"), vec!["sink"]);
        assert_eq!(
            topology.ancestor_computations("sink"),
            vec!["source", "left", "right"]
        );
        assert!(topology.ancestor_computations("source").is_empty());
        assert!(topology.descendant_computations("unknown").is_empty());
        assert_eq!(
            topology.streams().into_iter().collect::<Vec<_>>(),
            vec!["s1", "s2", "s3"]
        );
        let metadata = topology.metadata("left").unwrap();
        assert!(metadata.input_streams().contains("s1"));
        assert_eq!(metadata.reverse_map("s2"), Some("o1"));
        assert!(topology.supplier("right").is_some());
        assert!(topology.to_plantuml().contains("left ==> s2"));
    }

    #[test]
    fn test_invalid_topologies() {
        let cycle = Topology::builder()
            .add_computation(supplier("a", 1, 1), &["i1:s1", "o1:s2"])
            .add_computation(supplier("b", 1, 1), &["i1:s2", "o1:s1"])
            .build();
        assert!(matches!(cycle, Err(Error::Config(_))));

        let duplicate = Topology::builder()
            .add_computation(supplier("a", 0, 1), &["o1:s1"])
            .add_computation(supplier("a", 0, 1), &["o1:s2"])
            .build();
        assert!(duplicate.is_err());

        let malformed = Topology::builder()
            .add_computation(supplier("a", 0, 1), &["o1"])
            .build();
        assert!(malformed.is_err());

        let unknown = Topology::builder()
            .add_computation(supplier("a", 0, 1), &["o3:s1"])
            .build();
        assert!(unknown.is_err());
    }
}
