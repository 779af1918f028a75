// Layer construction — validated circuit → ordered layers with index tables
//
//   1. depth of every node = longest path to a leaf (children-first order)
//   2. bucket nodes by (depth, shape); shape = kind + arity, or family + scope
//      length for inputs
//   3. order buckets by (depth, first appearance in the children-first order)
//   4. resolve child references, scope variables and the parent-edge CSR
//
// A child is strictly shallower than its parent, so sorting by depth puts
// every child layer before its parents. The check in step 4 guards that
// ordering anyway and reports a compilation error instead of producing a plan
// that would read unfinished buffers.

use std::collections::{BTreeSet, HashMap};

use circuitry_core::{Circuit, Error, Node, NodeId, Result, StructureInfo};

use super::layer::{ChildRef, Layer, LayerKind, ParentEdge};

/// Layers in execution order plus the node → (layer, slot) map.
#[derive(Debug, Clone)]
pub(crate) struct LayerGraph {
    pub layers: Vec<Layer>,
    pub slots: Vec<ChildRef>,
}

fn shape_of(node: &Node, info: &StructureInfo, id: NodeId) -> LayerKind {
    match node {
        Node::Input { family, .. } => LayerKind::Input {
            family: *family,
            scope_len: info.scopes[id.0].len(),
        },
        Node::Product { children } => LayerKind::Product {
            arity: children.len(),
        },
        Node::Sum { children, .. } => LayerKind::Sum {
            arity: children.len(),
        },
    }
}

struct Bucket {
    depth: usize,
    first_seen: usize,
    kind: LayerKind,
    nodes: Vec<NodeId>,
}

pub(crate) fn build_layers(circuit: &Circuit, info: &StructureInfo) -> Result<LayerGraph> {
    let nodes = circuit.nodes();

    // 1. Depths
    let mut depth = vec![0usize; nodes.len()];
    for &id in &info.topo_order {
        depth[id.0] = nodes[id.0]
            .children()
            .iter()
            .map(|c| depth[c.0] + 1)
            .max()
            .unwrap_or(0);
    }

    // 2. Buckets
    let mut bucket_of: HashMap<(usize, LayerKind), usize> = HashMap::new();
    let mut buckets: Vec<Bucket> = Vec::new();
    for (pos, &id) in info.topo_order.iter().enumerate() {
        let kind = shape_of(&nodes[id.0], info, id);
        let key = (depth[id.0], kind);
        let b = *bucket_of.entry(key).or_insert_with(|| {
            buckets.push(Bucket {
                depth: depth[id.0],
                first_seen: pos,
                kind,
                nodes: Vec::new(),
            });
            buckets.len() - 1
        });
        buckets[b].nodes.push(id);
    }

    // 3. Order
    buckets.sort_by_key(|b| (b.depth, b.first_seen));

    let mut slots = vec![
        ChildRef {
            layer: usize::MAX,
            slot: usize::MAX,
        };
        nodes.len()
    ];
    for (l, bucket) in buckets.iter().enumerate() {
        for (s, id) in bucket.nodes.iter().enumerate() {
            slots[id.0] = ChildRef { layer: l, slot: s };
        }
    }

    // 4. Index tables
    let mut layers = Vec::with_capacity(buckets.len());
    for (l, bucket) in buckets.into_iter().enumerate() {
        let mut children = Vec::with_capacity(bucket.nodes.len() * bucket.kind.arity());
        let mut vars = Vec::new();
        let mut producers = BTreeSet::new();
        for &id in &bucket.nodes {
            match &nodes[id.0] {
                Node::Input { scope, .. } => vars.extend_from_slice(scope.vars()),
                node => {
                    for c in node.children() {
                        let r = slots[c.0];
                        if r.layer >= l {
                            return Err(Error::Compilation(format!(
                                "node {id} in layer {l} reads child {c} from layer {}",
                                r.layer
                            )));
                        }
                        producers.insert(r.layer);
                        children.push(r);
                    }
                }
            }
        }
        layers.push(Layer {
            index: l,
            depth: bucket.depth,
            kind: bucket.kind,
            nodes: bucket.nodes,
            children,
            vars,
            parent_offsets: Vec::new(),
            parent_edges: Vec::new(),
            producers: producers.into_iter().collect(),
            consumers: Vec::new(),
        });
    }

    link_parents(&mut layers);
    Ok(LayerGraph { layers, slots })
}

/// Fill `parent_offsets`, `parent_edges` and `consumers` from the child tables.
fn link_parents(layers: &mut [Layer]) {
    let mut incoming: Vec<Vec<Vec<ParentEdge>>> = layers
        .iter()
        .map(|layer| vec![Vec::new(); layer.num_nodes()])
        .collect();
    let mut consumers: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); layers.len()];

    for layer in layers.iter() {
        for (e, c) in layer.children.iter().enumerate() {
            incoming[c.layer][c.slot].push(ParentEdge {
                layer: layer.index,
                edge: e,
            });
            consumers[c.layer].insert(layer.index);
        }
    }

    for ((layer, per_node), cons) in layers.iter_mut().zip(incoming).zip(consumers) {
        let mut offsets = Vec::with_capacity(per_node.len() + 1);
        let mut edges = Vec::new();
        offsets.push(0);
        for list in per_node {
            edges.extend(list);
            offsets.push(edges.len());
        }
        layer.parent_offsets = offsets;
        layer.parent_edges = edges;
        layer.consumers = cons.into_iter().collect();
    }
}
