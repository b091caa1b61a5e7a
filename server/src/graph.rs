use std::collections::HashMap;

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use rayon::prelude::*;
use serde::Serialize;

use crate::embeddings::cosine_similarity;
use crate::session::Session;
use crate::vector_index::SessionIndex;

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
	pub id: String,
	pub group: usize,
	#[serde(rename = "type")]
	pub kind: &'static str,
	pub content: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub strength: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphLink {
	pub source: String,
	pub target: String,
	pub value: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphData {
	pub nodes: Vec<GraphNode>,
	pub links: Vec<GraphLink>,
}

/// Links stored sessions whose initial questions are at least `threshold`
/// similar, groups them into connected components and adds one category
/// node per group.
pub fn session_graph(sessions: &[Session], index: &SessionIndex, threshold: f32) -> GraphData {
	let n = sessions.len().min(index.len());
	if n == 0 {
		return GraphData::default();
	}

	let edges: Vec<(usize, usize, f32)> = (0..n)
		.into_par_iter()
		.flat_map_iter(|i| {
			let a = index.vector(i).unwrap_or(&[]);
			((i + 1)..n).filter_map(move |j| {
				let sim = cosine_similarity(a, index.vector(j).unwrap_or(&[]));
				(sim >= threshold).then_some((i, j, sim))
			})
		})
		.collect();

	let mut g: UnGraph<usize, f32> = UnGraph::with_capacity(n, edges.len());
	let ids: Vec<NodeIndex> = (0..n).map(|i| g.add_node(i)).collect();
	let mut components = UnionFind::<usize>::new(n);
	for (i, j, sim) in &edges {
		g.add_edge(ids[*i], ids[*j], *sim);
		components.union(*i, *j);
	}

	// Number groups in order of first appearance so output is stable.
	let labels = components.into_labeling();
	let mut group_of: HashMap<usize, usize> = HashMap::new();
	for label in &labels {
		let next = group_of.len() + 1;
		group_of.entry(*label).or_insert(next);
	}

	let mut out = GraphData::default();
	let mut representative: HashMap<usize, usize> = HashMap::new();
	for (i, label) in labels.iter().enumerate() {
		let best = representative.entry(group_of[label]).or_insert(i);
		if sessions[i].score > sessions[*best].score {
			*best = i;
		}
	}
	let mut groups: Vec<(usize, usize)> = representative.into_iter().collect();
	groups.sort();
	for (group, rep) in groups {
		out.nodes.push(GraphNode {
			id: category_id(group),
			group,
			kind: "category",
			content: sessions[rep].initial_question.clone(),
			strength: None,
		});
	}

	for node in g.node_indices() {
		let i = g[node];
		let s = &sessions[i];
		let group = group_of[&labels[i]];
		out.nodes.push(GraphNode {
			id: s.session_id.clone(),
			group,
			kind: "question",
			content: s.initial_question.clone(),
			strength: Some(s.chain_length.clamp(1, 10)),
		});
		out.links.push(GraphLink { source: category_id(group), target: s.session_id.clone(), value: 1.0 });
	}
	for e in g.edge_indices() {
		if let Some((a, b)) = g.edge_endpoints(e) {
			out.links.push(GraphLink {
				source: sessions[g[a]].session_id.clone(),
				target: sessions[g[b]].session_id.clone(),
				value: g[e],
			});
		}
	}
	out
}

fn category_id(group: usize) -> String {
	format!("cluster-{group}")
}
