use std::collections::{HashMap, HashSet};

use exposure_common::{GraphEdge, ImageSignal, TextSignal};

/// Upper bound on edges kept after a merge.
pub const MAX_EDGES: usize = 200;

/// Stable identity of an extracted signal across batches.
pub trait SignalKey {
    fn dedup_key(&self) -> String;
}

impl SignalKey for ImageSignal {
    fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.source_item_id, self.image_index, self.label)
    }
}

impl SignalKey for TextSignal {
    fn dedup_key(&self) -> String {
        format!(
            "{}:-:{}",
            self.source_item_id.as_deref().unwrap_or(""),
            self.value
        )
    }
}

/// Append unseen signals to `acc`, first write wins. Returns how many were added.
///
/// Duplicates inside `incoming` are collapsed too, so merging the same batch
/// twice leaves `acc` unchanged the second time.
pub fn merge_signals<T: SignalKey>(acc: &mut Vec<T>, incoming: Vec<T>) -> usize {
    let mut seen: HashSet<String> = acc.iter().map(SignalKey::dedup_key).collect();
    let before = acc.len();
    for signal in incoming {
        if seen.insert(signal.dedup_key()) {
            acc.push(signal);
        }
    }
    acc.len() - before
}

/// Merge edges by `source => target` key, keeping the stronger one.
///
/// Order follows first appearance of each key.
pub fn merge_edges(acc: Vec<GraphEdge>, incoming: Vec<GraphEdge>) -> Vec<GraphEdge> {
    let mut out: Vec<GraphEdge> = Vec::with_capacity(acc.len() + incoming.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for edge in acc.into_iter().chain(incoming) {
        let key = edge.key();
        match positions.get(&key) {
            Some(&i) => {
                if edge.strength > out[i].strength {
                    out[i] = edge;
                }
            }
            None => {
                positions.insert(key, out.len());
                out.push(edge);
            }
        }
    }
    out
}

/// The `cap` strongest edges, strongest first. Ties keep their merge order.
pub fn top_edges(mut edges: Vec<GraphEdge>, cap: usize) -> Vec<GraphEdge> {
    edges.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    edges.truncate(cap);
    edges
}
