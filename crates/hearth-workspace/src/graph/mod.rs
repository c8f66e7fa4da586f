//! Parsed workspace trees: block maps, wiring validation, reload comparison.

pub mod node;
pub mod primitive;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use node::BlockNode;

/// Structural problems that reject a saved tree. Anything listed here aborts
/// the tab load; per-input decode problems do not (see [`primitive::DecodeError`]).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("invalid workspace json: {0}")]
    Json(String),
    #[error("workspace json has no target.blocks object")]
    MissingBlocks,
    #[error("block <{id}> is not a json object")]
    NodeNotObject { id: String },
    #[error("block <{id}> has unusable opcode <{opcode}>")]
    BadOpcode { id: String, opcode: String },
    #[error("block <{id}> field <{name}> is not an array")]
    BadField { id: String, name: String },
    #[error("block <{id}> {link} reference <{target}> does not exist")]
    DanglingRef { id: String, link: &'static str, target: String },
}

/// All blocks of one tab, keyed by node id.
#[derive(Debug, Default)]
pub struct BlockGraph {
    nodes: HashMap<String, Arc<BlockNode>>,
}

impl BlockGraph {
    /// Parse one saved tab payload. Every `parent`/`next` reference must
    /// resolve to a node in the same tree.
    pub fn parse(content: &str) -> Result<BlockGraph, ParseError> {
        let root: serde_json::Value =
            serde_json::from_str(content).map_err(|err| ParseError::Json(err.to_string()))?;
        let blocks = root
            .get("target")
            .and_then(|target| target.get("blocks"))
            .and_then(|blocks| blocks.as_object())
            .ok_or(ParseError::MissingBlocks)?;

        let mut nodes = HashMap::with_capacity(blocks.len());
        for (id, raw) in blocks {
            let node = BlockNode::from_saved(id, raw)?;
            nodes.insert(id.clone(), Arc::new(node));
        }

        for node in nodes.values() {
            for (link, target) in [("parent", &node.parent), ("next", &node.next)] {
                if let Some(target) = target {
                    if !nodes.contains_key(target) {
                        return Err(ParseError::DanglingRef {
                            id: node.id.clone(),
                            link,
                            target: target.clone(),
                        });
                    }
                }
            }
        }

        Ok(BlockGraph { nodes })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<BlockNode>> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<BlockNode>> {
        self.nodes.values()
    }

    /// Standing entry points: top level, not shadows. Sorted by id so task
    /// startup order is stable across reloads.
    pub fn top_level(&self) -> Vec<Arc<BlockNode>> {
        let mut nodes: Vec<Arc<BlockNode>> = self
            .nodes
            .values()
            .filter(|node| node.top_level && !node.shadow)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// True when `other` parses to the same wiring, fields and inputs.
    /// Runtime cells are ignored.
    pub fn same_structure(&self, other: &BlockGraph) -> bool {
        self.nodes.len() == other.nodes.len()
            && self.nodes.iter().all(|(id, node)| {
                other
                    .nodes
                    .get(id)
                    .is_some_and(|candidate| node.same_shape(candidate))
            })
    }
}

/// True when the saved payload carries nothing worth loading: blank content,
/// or a target whose `blocks` and `comments` maps are both empty.
pub fn is_empty_content(content: &str) -> bool {
    if content.trim().is_empty() {
        return true;
    }
    let Ok(root) = serde_json::from_str::<serde_json::Value>(content) else {
        // Not decidable here; let parse report the real problem.
        return false;
    };
    let Some(target) = root.get("target") else {
        return false;
    };
    let empty = |key: &str| {
        target
            .get(key)
            .and_then(|v| v.as_object())
            .map(|map| map.is_empty())
            .unwrap_or(true)
    };
    empty("blocks") && empty("comments")
}
