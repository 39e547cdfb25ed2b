//! Authoritative scene graph.
//!
//! Holds every node, tag group, tag and layer, tracks which sessions
//! subscribed to what, and turns each client request into the events the
//! affected sessions must receive. No IO happens here; the server loop
//! delivers the returned [`Delivery`] list.
//!
//! Creation events go to every subscriber, including the requester, so
//! clients learn the ids the server assigned. Value events skip the session
//! that set the value.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use particle_shared::protocol::{
    node_id, DataType, Event, ItemId, LayerId, NodeId, Request, SessionId, TagGroupId, TagId,
    UserId, Value,
};
use tracing::{debug, warn};

/// One event addressed to one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: SessionId,
    pub event: Event,
}

#[derive(Debug, Clone)]
struct Tag {
    data_type: DataType,
    count: u8,
    custom_type: u16,
    value: Option<Value>,
}

#[derive(Debug, Clone, Default)]
struct TagGroup {
    custom_type: u16,
    tags: BTreeMap<TagId, Tag>,
    next_tag: TagId,
    subscribers: BTreeSet<SessionId>,
}

#[derive(Debug, Clone)]
struct Layer {
    parent_layer_id: Option<LayerId>,
    data_type: DataType,
    count: u8,
    custom_type: u16,
    items: BTreeMap<ItemId, Value>,
    subscribers: BTreeSet<SessionId>,
}

#[derive(Debug, Clone)]
struct GraphNode {
    parent: NodeId,
    owner: UserId,
    custom_type: u16,
    children: Vec<NodeId>,
    subscribers: BTreeSet<SessionId>,
    taggroups: BTreeMap<TagGroupId, TagGroup>,
    next_taggroup: TagGroupId,
    layers: BTreeMap<LayerId, Layer>,
    next_layer: LayerId,
}

impl GraphNode {
    fn new(parent: NodeId, owner: UserId, custom_type: u16) -> Self {
        Self {
            parent,
            owner,
            custom_type,
            children: Vec::new(),
            subscribers: BTreeSet::new(),
            taggroups: BTreeMap::new(),
            next_taggroup: 0,
            layers: BTreeMap::new(),
            next_layer: 0,
        }
    }
}

/// Owner id of the well-known nodes.
const SERVER_USER: UserId = 0;

#[derive(Debug)]
pub struct SceneGraph {
    nodes: HashMap<NodeId, GraphNode>,
    users: HashMap<String, UserId>,
    next_user: UserId,
    next_node: NodeId,
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneGraph {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(node_id::ROOT, GraphNode::new(node_id::ROOT, SERVER_USER, 0));
        for id in [
            node_id::AVATAR_PARENT,
            node_id::USER_PARENT,
            node_id::SCENE_PARENT,
        ] {
            nodes.insert(id, GraphNode::new(node_id::ROOT, SERVER_USER, 0));
            if let Some(root) = nodes.get_mut(&node_id::ROOT) {
                root.children.push(id);
            }
        }
        Self {
            nodes,
            users: HashMap::new(),
            next_user: 1,
            next_node: node_id::FIRST_DYNAMIC,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).map(|n| n.parent)
    }

    fn is_well_known(id: NodeId) -> bool {
        id < node_id::FIRST_DYNAMIC
    }

    fn add_node(&mut self, parent: NodeId, owner: UserId, custom_type: u16) -> NodeId {
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(id, GraphNode::new(parent, owner, custom_type));
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        id
    }

    fn to_all(subscribers: &BTreeSet<SessionId>, event: &Event) -> Vec<Delivery> {
        subscribers
            .iter()
            .map(|&to| Delivery {
                to,
                event: event.clone(),
            })
            .collect()
    }

    fn to_others(
        subscribers: &BTreeSet<SessionId>,
        origin: SessionId,
        event: &Event,
    ) -> Vec<Delivery> {
        subscribers
            .iter()
            .filter(|&&s| s != origin)
            .map(|&to| Delivery {
                to,
                event: event.clone(),
            })
            .collect()
    }

    fn node_create_event(&self, id: NodeId) -> Option<Event> {
        self.nodes.get(&id).map(|n| Event::NodeCreate {
            node_id: id,
            parent_id: n.parent,
            user_id: n.owner,
            custom_type: n.custom_type,
        })
    }

    /// Admits a session: assigns its user id and a fresh avatar node.
    ///
    /// Returns the accept event plus the avatar announcement, or the reason
    /// the login was refused.
    pub fn connect(
        &mut self,
        session: SessionId,
        username: &str,
    ) -> Result<Vec<Delivery>, String> {
        if username.is_empty() {
            return Err("empty username".to_string());
        }
        let user_id = match self.users.get(username) {
            Some(&id) => id,
            None => {
                let id = self.next_user;
                self.next_user = self.next_user.wrapping_add(1).max(1);
                self.users.insert(username.to_string(), id);
                id
            }
        };
        let avatar_id = self.add_node(node_id::AVATAR_PARENT, user_id, 0);

        let mut out = vec![Delivery {
            to: session,
            event: Event::ConnectAccept {
                session_id: session,
                user_id,
                avatar_id,
            },
        }];
        if let (Some(event), Some(parent)) = (
            self.node_create_event(avatar_id),
            self.nodes.get(&node_id::AVATAR_PARENT),
        ) {
            out.extend(Self::to_all(&parent.subscribers, &event));
        }
        debug!(session, user_id, avatar_id, username, "Session admitted");
        Ok(out)
    }

    /// Drops a session: its avatar subtree goes away, its subscriptions end.
    pub fn disconnect(&mut self, session: SessionId, avatar_id: NodeId) -> Vec<Delivery> {
        for node in self.nodes.values_mut() {
            node.subscribers.remove(&session);
            for tg in node.taggroups.values_mut() {
                tg.subscribers.remove(&session);
            }
            for layer in node.layers.values_mut() {
                layer.subscribers.remove(&session);
            }
        }
        self.destroy(avatar_id)
    }

    /// Applies one request from `session`, whose avatar is `avatar_id`.
    pub fn apply(
        &mut self,
        session: SessionId,
        user_id: UserId,
        avatar_id: NodeId,
        req: Request,
    ) -> Vec<Delivery> {
        match req {
            Request::Connect { .. } | Request::Terminate => {
                warn!(session, "Session request handled outside the graph");
                Vec::new()
            }
            Request::NodeCreate { custom_type } => {
                let id = self.add_node(avatar_id, user_id, custom_type);
                debug!(session, node_id = id, custom_type, "Node created");
                match (self.node_create_event(id), self.nodes.get(&avatar_id)) {
                    (Some(event), Some(parent)) => Self::to_all(&parent.subscribers, &event),
                    _ => Vec::new(),
                }
            }
            Request::NodeDestroy { node_id } => {
                if Self::is_well_known(node_id) {
                    warn!(session, node_id, "Refusing to destroy well-known node");
                    return Vec::new();
                }
                self.destroy(node_id)
            }
            Request::NodeLink {
                parent_id,
                child_id,
            } => self.link(parent_id, child_id),
            Request::NodeSubscribe { node_id } => self.subscribe_node(session, node_id),
            Request::TagGroupCreate {
                node_id,
                custom_type,
            } => {
                let Some(node) = self.nodes.get_mut(&node_id) else {
                    return Vec::new();
                };
                let taggroup_id = node.next_taggroup;
                node.next_taggroup += 1;
                node.taggroups.insert(
                    taggroup_id,
                    TagGroup {
                        custom_type,
                        ..Default::default()
                    },
                );
                let event = Event::TagGroupCreate {
                    node_id,
                    taggroup_id,
                    custom_type,
                };
                Self::to_all(&node.subscribers, &event)
            }
            Request::TagGroupSubscribe {
                node_id,
                taggroup_id,
            } => {
                let Some(tg) = self
                    .nodes
                    .get_mut(&node_id)
                    .and_then(|n| n.taggroups.get_mut(&taggroup_id))
                else {
                    return Vec::new();
                };
                tg.subscribers.insert(session);
                let mut out = Vec::new();
                for (&tag_id, tag) in &tg.tags {
                    out.push(Delivery {
                        to: session,
                        event: Event::TagCreate {
                            node_id,
                            taggroup_id,
                            tag_id,
                            data_type: tag.data_type,
                            count: tag.count,
                            custom_type: tag.custom_type,
                        },
                    });
                    if let Some(value) = &tag.value {
                        out.push(Delivery {
                            to: session,
                            event: Event::TagSetValue {
                                node_id,
                                taggroup_id,
                                tag_id,
                                value: value.clone(),
                            },
                        });
                    }
                }
                out
            }
            Request::TagCreate {
                node_id,
                taggroup_id,
                data_type,
                count,
                custom_type,
            } => {
                let Some(tg) = self
                    .nodes
                    .get_mut(&node_id)
                    .and_then(|n| n.taggroups.get_mut(&taggroup_id))
                else {
                    return Vec::new();
                };
                let tag_id = tg.next_tag;
                tg.next_tag += 1;
                tg.tags.insert(
                    tag_id,
                    Tag {
                        data_type,
                        count,
                        custom_type,
                        value: None,
                    },
                );
                let event = Event::TagCreate {
                    node_id,
                    taggroup_id,
                    tag_id,
                    data_type,
                    count,
                    custom_type,
                };
                Self::to_all(&tg.subscribers, &event)
            }
            Request::TagSetValue {
                node_id,
                taggroup_id,
                tag_id,
                value,
            } => {
                let Some(tg) = self
                    .nodes
                    .get_mut(&node_id)
                    .and_then(|n| n.taggroups.get_mut(&taggroup_id))
                else {
                    return Vec::new();
                };
                let Some(tag) = tg.tags.get_mut(&tag_id) else {
                    return Vec::new();
                };
                if value.data_type() != tag.data_type || value.count() != usize::from(tag.count) {
                    warn!(session, node_id, tag_id, "Tag value of wrong shape dropped");
                    return Vec::new();
                }
                tag.value = Some(value.clone());
                let event = Event::TagSetValue {
                    node_id,
                    taggroup_id,
                    tag_id,
                    value,
                };
                Self::to_others(&tg.subscribers, session, &event)
            }
            Request::LayerCreate {
                node_id,
                parent_layer_id,
                data_type,
                count,
                custom_type,
            } => {
                let Some(node) = self.nodes.get_mut(&node_id) else {
                    return Vec::new();
                };
                let layer_id = node.next_layer;
                node.next_layer += 1;
                node.layers.insert(
                    layer_id,
                    Layer {
                        parent_layer_id,
                        data_type,
                        count,
                        custom_type,
                        items: BTreeMap::new(),
                        subscribers: BTreeSet::new(),
                    },
                );
                let event = Event::LayerCreate {
                    node_id,
                    parent_layer_id,
                    layer_id,
                    data_type,
                    count,
                    custom_type,
                };
                Self::to_all(&node.subscribers, &event)
            }
            Request::LayerSubscribe { node_id, layer_id } => {
                let Some(layer) = self
                    .nodes
                    .get_mut(&node_id)
                    .and_then(|n| n.layers.get_mut(&layer_id))
                else {
                    return Vec::new();
                };
                layer.subscribers.insert(session);
                layer
                    .items
                    .iter()
                    .map(|(&item_id, value)| Delivery {
                        to: session,
                        event: Event::LayerSetValue {
                            node_id,
                            layer_id,
                            item_id,
                            value: value.clone(),
                        },
                    })
                    .collect()
            }
            Request::LayerSetValue {
                node_id,
                layer_id,
                item_id,
                value,
            } => {
                let Some(layer) = self
                    .nodes
                    .get_mut(&node_id)
                    .and_then(|n| n.layers.get_mut(&layer_id))
                else {
                    return Vec::new();
                };
                if value.data_type() != layer.data_type || value.count() != usize::from(layer.count)
                {
                    warn!(session, node_id, layer_id, "Layer value of wrong shape dropped");
                    return Vec::new();
                }
                layer.items.insert(item_id, value.clone());
                let event = Event::LayerSetValue {
                    node_id,
                    layer_id,
                    item_id,
                    value,
                };
                Self::to_others(&layer.subscribers, session, &event)
            }
            Request::LayerUnsetValue {
                node_id,
                layer_id,
                item_id,
            } => {
                let Some(layer) = self
                    .nodes
                    .get_mut(&node_id)
                    .and_then(|n| n.layers.get_mut(&layer_id))
                else {
                    return Vec::new();
                };
                if layer.items.remove(&item_id).is_none() {
                    return Vec::new();
                }
                let event = Event::LayerUnsetValue {
                    node_id,
                    layer_id,
                    item_id,
                };
                Self::to_others(&layer.subscribers, session, &event)
            }
        }
    }

    fn subscribe_node(&mut self, session: SessionId, id: NodeId) -> Vec<Delivery> {
        let Some(node) = self.nodes.get_mut(&id) else {
            warn!(session, node_id = id, "Subscribe to unknown node");
            return Vec::new();
        };
        node.subscribers.insert(session);

        let node = &self.nodes[&id];
        let mut out: Vec<Delivery> = node
            .children
            .iter()
            .filter_map(|&c| self.node_create_event(c))
            .map(|event| Delivery { to: session, event })
            .collect();
        out.extend(node.taggroups.iter().map(|(&taggroup_id, tg)| Delivery {
            to: session,
            event: Event::TagGroupCreate {
                node_id: id,
                taggroup_id,
                custom_type: tg.custom_type,
            },
        }));
        out.extend(node.layers.iter().map(|(&layer_id, l)| Delivery {
            to: session,
            event: Event::LayerCreate {
                node_id: id,
                parent_layer_id: l.parent_layer_id,
                layer_id,
                data_type: l.data_type,
                count: l.count,
                custom_type: l.custom_type,
            },
        }));
        out
    }

    fn is_descendant(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut cur = id;
        loop {
            if cur == ancestor {
                return true;
            }
            match self.nodes.get(&cur) {
                Some(n) if n.parent != cur => cur = n.parent,
                _ => return false,
            }
        }
    }

    fn link(&mut self, parent_id: NodeId, child_id: NodeId) -> Vec<Delivery> {
        if Self::is_well_known(child_id)
            || !self.nodes.contains_key(&parent_id)
            || !self.nodes.contains_key(&child_id)
            || self.is_descendant(parent_id, child_id)
        {
            warn!(parent_id, child_id, "Invalid node link");
            return Vec::new();
        }
        let Some(old_parent) = self.parent_of(child_id) else {
            return Vec::new();
        };
        if old_parent == parent_id {
            return Vec::new();
        }
        if let Some(p) = self.nodes.get_mut(&old_parent) {
            p.children.retain(|&c| c != child_id);
        }
        if let Some(p) = self.nodes.get_mut(&parent_id) {
            p.children.push(child_id);
        }
        if let Some(c) = self.nodes.get_mut(&child_id) {
            c.parent = parent_id;
        }
        debug!(parent_id, child_id, old_parent, "Node linked");

        let mut out = Vec::new();
        let link = Event::NodeLink {
            parent_id,
            child_id,
        };
        if let Some(old) = self.nodes.get(&old_parent) {
            out.extend(Self::to_all(&old.subscribers, &link));
        }
        if let (Some(event), Some(new)) =
            (self.node_create_event(child_id), self.nodes.get(&parent_id))
        {
            out.extend(Self::to_all(&new.subscribers, &event));
        }
        out
    }

    fn destroy(&mut self, id: NodeId) -> Vec<Delivery> {
        let Some(parent) = self.parent_of(id) else {
            return Vec::new();
        };
        let mut recipients = BTreeSet::new();
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|&c| c != id);
            recipients.extend(p.subscribers.iter().copied());
        }

        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let Some(node) = self.nodes.remove(&cur) else {
                continue;
            };
            stack.extend(node.children.iter().copied());
            let mut to = node.subscribers;
            if cur == id {
                to.extend(recipients.iter().copied());
            }
            out.extend(Self::to_all(&to, &Event::NodeDestroy { node_id: cur }));
        }
        debug!(node_id = id, "Node destroyed");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use particle_shared::protocol::custom_type;

    fn events_for(out: &[Delivery], to: SessionId) -> Vec<&Event> {
        out.iter().filter(|d| d.to == to).map(|d| &d.event).collect()
    }

    fn login(g: &mut SceneGraph, session: SessionId, name: &str) -> (UserId, NodeId) {
        let out = g.connect(session, name).unwrap();
        match out[0].event {
            Event::ConnectAccept {
                user_id, avatar_id, ..
            } => (user_id, avatar_id),
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_username_is_rejected() {
        let mut g = SceneGraph::new();
        assert!(g.connect(1, "").is_err());
    }

    #[test]
    fn same_username_keeps_user_id() {
        let mut g = SceneGraph::new();
        let (a, avatar_a) = login(&mut g, 1, "alice");
        let (b, avatar_b) = login(&mut g, 2, "alice");
        let (c, _) = login(&mut g, 3, "bob");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(avatar_a, avatar_b);
    }

    #[test]
    fn node_create_is_announced_under_avatar() {
        let mut g = SceneGraph::new();
        let (user, avatar) = login(&mut g, 1, "alice");
        g.apply(1, user, avatar, Request::NodeSubscribe { node_id: avatar });
        let out = g.apply(
            1,
            user,
            avatar,
            Request::NodeCreate {
                custom_type: custom_type::SCENE_NODE,
            },
        );
        assert_eq!(
            events_for(&out, 1),
            vec![&Event::NodeCreate {
                node_id: avatar + 1,
                parent_id: avatar,
                user_id: user,
                custom_type: custom_type::SCENE_NODE,
            }]
        );
    }

    #[test]
    fn link_announces_to_new_parent_subscribers() {
        let mut g = SceneGraph::new();
        let (ua, avatar_a) = login(&mut g, 1, "sender");
        let (ub, avatar_b) = login(&mut g, 2, "receiver");
        g.apply(2, ub, avatar_b, Request::NodeSubscribe {
            node_id: node_id::SCENE_PARENT,
        });
        g.apply(1, ua, avatar_a, Request::NodeCreate { custom_type: 100 });
        let scene = avatar_b + 1;

        let out = g.apply(
            1,
            ua,
            avatar_a,
            Request::NodeLink {
                parent_id: node_id::SCENE_PARENT,
                child_id: scene,
            },
        );
        assert!(events_for(&out, 2).contains(&&Event::NodeCreate {
            node_id: scene,
            parent_id: node_id::SCENE_PARENT,
            user_id: ua,
            custom_type: 100,
        }));
        assert_eq!(g.parent_of(scene), Some(node_id::SCENE_PARENT));

        // A cycle is refused.
        assert!(g
            .apply(1, ua, avatar_a, Request::NodeLink {
                parent_id: scene,
                child_id: scene
            })
            .is_empty());
    }

    #[test]
    fn values_fan_out_to_other_subscribers_and_replay() {
        let mut g = SceneGraph::new();
        let (ua, avatar_a) = login(&mut g, 1, "sender");
        let (ub, avatar_b) = login(&mut g, 2, "receiver");
        let node = avatar_b + 1;
        g.apply(1, ua, avatar_a, Request::NodeCreate { custom_type: 101 });
        for (s, u, a) in [(1, ua, avatar_a), (2, ub, avatar_b)] {
            g.apply(s, u, a, Request::NodeSubscribe { node_id: node });
        }
        g.apply(1, ua, avatar_a, Request::LayerCreate {
            node_id: node,
            parent_layer_id: None,
            data_type: DataType::Real32,
            count: 3,
            custom_type: 400,
        });
        g.apply(2, ub, avatar_b, Request::LayerSubscribe {
            node_id: node,
            layer_id: 0,
        });

        let set = Request::LayerSetValue {
            node_id: node,
            layer_id: 0,
            item_id: 5,
            value: Value::Real32(vec![1.0, 2.0, 3.0]),
        };
        let out = g.apply(1, ua, avatar_a, set);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, 2);

        // Wrong shape is dropped.
        let bad = Request::LayerSetValue {
            node_id: node,
            layer_id: 0,
            item_id: 6,
            value: Value::UInt16(vec![1]),
        };
        assert!(g.apply(1, ua, avatar_a, bad).is_empty());

        // A late subscriber gets the stored item.
        let (uc, avatar_c) = login(&mut g, 3, "late");
        let replay = g.apply(3, uc, avatar_c, Request::LayerSubscribe {
            node_id: node,
            layer_id: 0,
        });
        assert!(matches!(
            replay.as_slice(),
            [Delivery { to: 3, event: Event::LayerSetValue { item_id: 5, .. } }]
        ));
    }

    #[test]
    fn disconnect_destroys_avatar_subtree() {
        let mut g = SceneGraph::new();
        let (ua, avatar_a) = login(&mut g, 1, "sender");
        let (ub, avatar_b) = login(&mut g, 2, "watcher");
        g.apply(1, ua, avatar_a, Request::NodeCreate { custom_type: 101 });
        let child = avatar_b + 1;
        g.apply(2, ub, avatar_b, Request::NodeSubscribe { node_id: avatar_a });

        let before = g.node_count();
        let out = g.disconnect(1, avatar_a);
        assert_eq!(g.node_count(), before - 2);
        assert!(!g.contains(child));
        assert!(events_for(&out, 2).contains(&&Event::NodeDestroy { node_id: avatar_a }));
    }
}
