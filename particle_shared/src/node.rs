//! Node graph mirror.
//!
//! Local copy of the part of the remote scene graph the particle demo cares
//! about: one scene node, its sender children and their particle children.
//! Nodes live in a generational arena; the id lookup table and sender role
//! objects refer to them by [`NodeHandle`], which goes stale once the node is
//! removed.
//!
//! Resource ids (tag groups, tags, layers) start unassigned and are filled in
//! as the matching create events arrive.

use crate::math::Vec3;
use crate::protocol::{LayerId, NodeId, TagGroupId, TagId, UserId};

/// Generational index into a [`NodeGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneNode {
    pub taggroup_id: Option<TagGroupId>,
    pub sender_count_tag: Option<TagId>,
    pub frame_tag: Option<TagId>,
    pub sender_count: Option<u16>,
    pub frame: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderNode {
    /// Index of the bound sender role object.
    pub sender: Option<usize>,
    pub taggroup_id: Option<TagGroupId>,
    pub frame_tag: Option<TagId>,
    pub particle_count_tag: Option<TagId>,
    pub sender_id_tag: Option<TagId>,
    pub position_tag: Option<TagId>,
    pub layer_id: Option<LayerId>,
    pub frame: Option<i64>,
    pub particle_count: Option<u16>,
    pub sender_id: Option<u16>,
    pub position: Option<Vec3>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleNode {
    pub taggroup_id: Option<TagGroupId>,
    pub particle_id_tag: Option<TagId>,
    pub position_tag: Option<TagId>,
    pub particle_id: Option<u16>,
    pub position: Option<Vec3>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Scene(SceneNode),
    Sender(SenderNode),
    Particle(ParticleNode),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Scene(_) => "scene",
            NodeKind::Sender(_) => "sender",
            NodeKind::Particle(_) => "particle",
        }
    }

    /// Tag group id of whichever node kind this is.
    pub fn taggroup_id(&self) -> Option<TagGroupId> {
        match self {
            NodeKind::Scene(n) => n.taggroup_id,
            NodeKind::Sender(n) => n.taggroup_id,
            NodeKind::Particle(n) => n.taggroup_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub user_id: UserId,
    pub parent: Option<NodeHandle>,
    pub children: Vec<NodeHandle>,
    pub kind: NodeKind,
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    node: Option<Node>,
}

/// Arena-owned mirror of scene/sender/particle nodes.
#[derive(Debug, Default)]
pub struct NodeGraph {
    entries: Vec<Entry>,
    free: Vec<u32>,
    scene: Option<NodeHandle>,
    len: usize,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mirrored scene node, if one is known.
    pub fn scene(&self) -> Option<NodeHandle> {
        self.scene
    }

    /// Adds a node, linking it under `parent` when given.
    ///
    /// The first scene node inserted becomes the graph's scene.
    pub fn insert(
        &mut self,
        id: NodeId,
        user_id: UserId,
        parent: Option<NodeHandle>,
        kind: NodeKind,
    ) -> NodeHandle {
        let is_scene = matches!(kind, NodeKind::Scene(_));
        let node = Node {
            id,
            user_id,
            parent: parent.filter(|p| self.get(*p).is_some()),
            children: Vec::new(),
            kind,
        };

        let handle = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.node = Some(node);
                NodeHandle {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    node: Some(node),
                });
                NodeHandle {
                    index: (self.entries.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.len += 1;

        if let Some(parent) = parent {
            if let Some(p) = self.get_mut(parent) {
                p.children.push(handle);
            }
        }
        if is_scene && self.scene.is_none() {
            self.scene = Some(handle);
        }
        handle
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&Node> {
        self.entries
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.node.as_ref())
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.node.as_mut())
    }

    /// Number of sender nodes directly under `parent`.
    pub fn sender_children(&self, parent: NodeHandle) -> usize {
        self.get(parent).map_or(0, |p| {
            p.children
                .iter()
                .filter_map(|&c| self.get(c))
                .filter(|c| matches!(c.kind, NodeKind::Sender(_)))
                .count()
        })
    }

    /// Removes `handle` and all its descendants, returning the removed nodes
    /// (parents before children).
    pub fn remove_subtree(&mut self, handle: NodeHandle) -> Vec<Node> {
        let Some(parent) = self.get(handle).map(|n| n.parent) else {
            return Vec::new();
        };
        if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
            p.children.retain(|&c| c != handle);
        }

        let mut removed = Vec::new();
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            let Some(node) = self.take(h) else { continue };
            stack.extend(node.children.iter().rev().copied());
            removed.push(node);
        }
        removed
    }

    fn take(&mut self, handle: NodeHandle) -> Option<Node> {
        let entry = self.entries.get_mut(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let node = entry.node.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        if self.scene == Some(handle) {
            self.scene = None;
        }
        Some(node)
    }

    /// Iterates over all live nodes.
    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &Node)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.node.as_ref().map(|n| {
                (
                    NodeHandle {
                        index: i as u32,
                        generation: e.generation,
                    },
                    n,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> NodeKind {
        NodeKind::Sender(SenderNode::default())
    }

    #[test]
    fn first_scene_becomes_the_scene() {
        let mut g = NodeGraph::new();
        let a = g.insert(65_536, 1, None, NodeKind::Scene(SceneNode::default()));
        let b = g.insert(65_537, 1, None, NodeKind::Scene(SceneNode::default()));
        assert_eq!(g.scene(), Some(a));
        assert_ne!(a, b);
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn children_are_linked_and_counted() {
        let mut g = NodeGraph::new();
        let scene = g.insert(10, 1, None, NodeKind::Scene(SceneNode::default()));
        let s1 = g.insert(11, 1, Some(scene), sender());
        g.insert(12, 1, Some(scene), sender());
        g.insert(13, 1, Some(s1), NodeKind::Particle(ParticleNode::default()));

        assert_eq!(g.sender_children(scene), 2);
        assert_eq!(g.sender_children(s1), 0);
        assert_eq!(g.get(s1).unwrap().parent, Some(scene));
        assert_eq!(g.get(s1).unwrap().children.len(), 1);
    }

    #[test]
    fn removing_a_subtree_invalidates_handles() {
        let mut g = NodeGraph::new();
        let scene = g.insert(10, 1, None, NodeKind::Scene(SceneNode::default()));
        let s1 = g.insert(11, 1, Some(scene), sender());
        let p = g.insert(12, 1, Some(s1), NodeKind::Particle(ParticleNode::default()));
        let s2 = g.insert(13, 1, Some(scene), sender());

        let removed: Vec<NodeId> = g.remove_subtree(s1).into_iter().map(|n| n.id).collect();
        assert_eq!(removed, vec![11, 12]);
        assert!(g.get(s1).is_none());
        assert!(g.get(p).is_none());
        assert_eq!(g.sender_children(scene), 1);
        assert!(g.get(s2).is_some());

        // The freed slot is reused under a new generation.
        let s3 = g.insert(14, 1, Some(scene), sender());
        assert!(g.get(s1).is_none());
        assert_eq!(g.get(s3).unwrap().id, 14);
    }

    #[test]
    fn removing_the_scene_clears_everything() {
        let mut g = NodeGraph::new();
        let scene = g.insert(10, 1, None, NodeKind::Scene(SceneNode::default()));
        g.insert(11, 1, Some(scene), sender());
        assert_eq!(g.remove_subtree(scene).len(), 2);
        assert_eq!(g.scene(), None);
        assert!(g.is_empty());
        assert_eq!(g.iter().count(), 0);
    }
}
