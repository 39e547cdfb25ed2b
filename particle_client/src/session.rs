//! Graph synchronization state machine.
//!
//! A [`Session`] consumes decoded server [`Event`]s one at a time and keeps
//! the local node mirror, the id lookup table and the sender bindings in
//! step with the remote scene. Side effects are requests queued in an outbox
//! that the client loop flushes after each batch of events.
//!
//! Everything here runs on the single event-processing task. The only shared
//! state it touches is the sender pool: timers and receipt trackers are
//! locked one at a time (timer first, released, then tracker).

use std::sync::Arc;

use particle_shared::config::{ClientConfig, Role};
use particle_shared::lu_table::LookupTable;
use particle_shared::node::{
    Node, NodeGraph, NodeHandle, NodeKind, ParticleNode, SceneNode, SenderNode,
};
use particle_shared::protocol::{
    custom_type, node_id, shape, DataType, Event, ItemId, LayerId, NodeId, Request, SessionId,
    TagGroupId, TagId, UserId, Value, ValueShape,
};
use particle_shared::received::Receipt;
use particle_shared::sender::SenderPool;
use tracing::{debug, error, info, warn};

use crate::publish::{self, PublishTarget};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unconnected,
    Connected {
        session_id: SessionId,
        user_id: UserId,
        avatar_id: NodeId,
    },
    Terminated,
}

/// What the event loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

/// The part of the client configuration the state machine uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub role: Role,
    pub sender_count: u16,
    pub lookup_capacity: usize,
    pub preroll_frames: u32,
}

impl From<&ClientConfig> for SessionConfig {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            role: cfg.role,
            sender_count: cfg.sender_count,
            lookup_capacity: cfg.lookup_capacity,
            preroll_frames: cfg.preroll(),
        }
    }
}

pub struct Session {
    cfg: SessionConfig,
    state: ConnState,
    lookup: LookupTable<NodeHandle>,
    graph: NodeGraph,
    /// Sender role object index → bound sender node.
    bindings: Vec<Option<NodeHandle>>,
    /// Last total frame published per sender.
    last_published: Vec<Option<i64>>,
    pool: Arc<SenderPool>,
    outbox: Vec<Request>,
    closing: bool,
}

impl Session {
    pub fn new(cfg: SessionConfig, pool: Arc<SenderPool>) -> Self {
        let senders = pool.len();
        Self {
            lookup: LookupTable::new(cfg.lookup_capacity),
            cfg,
            state: ConnState::Unconnected,
            graph: NodeGraph::new(),
            bindings: vec![None; senders],
            last_published: vec![None; senders],
            pool,
            outbox: Vec::new(),
            closing: false,
        }
    }

    pub fn role(&self) -> Role {
        self.cfg.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn pool(&self) -> &Arc<SenderPool> {
        &self.pool
    }

    /// Mirrored node with server id `id`.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.lookup.find(id).and_then(|h| self.graph.get(h))
    }

    /// Node bound to sender role object `index`.
    pub fn bound_node(&self, index: usize) -> Option<&Node> {
        self.bindings
            .get(index)
            .copied()
            .flatten()
            .and_then(|h| self.graph.get(h))
    }

    pub fn pending(&self) -> &[Request] {
        &self.outbox
    }

    pub fn drain_outbox(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.outbox)
    }

    fn own_ids(&self) -> Option<(UserId, NodeId)> {
        match self.state {
            ConnState::Connected {
                user_id, avatar_id, ..
            } => Some((user_id, avatar_id)),
            _ => None,
        }
    }

    fn resolve(&self, id: NodeId) -> Option<NodeHandle> {
        let handle = self.lookup.find(id);
        if handle.is_none() {
            warn!(node_id = id, "Event for unknown node ignored");
        }
        handle
    }

    /// Applies one server event.
    pub fn handle(&mut self, event: Event) -> Flow {
        if self.state == ConnState::Terminated {
            return Flow::Terminate;
        }
        match event {
            Event::ConnectAccept {
                session_id,
                user_id,
                avatar_id,
            } => self.on_connect_accept(session_id, user_id, avatar_id),
            Event::ConnectTerminate { reason } => {
                info!(%reason, "Connection terminated");
                self.state = ConnState::Terminated;
                return Flow::Terminate;
            }
            Event::NodeCreate {
                node_id,
                parent_id,
                user_id,
                custom_type,
            } => self.on_node_create(node_id, parent_id, user_id, custom_type),
            Event::NodeDestroy { node_id } => self.on_node_destroy(node_id),
            Event::NodeLink {
                parent_id,
                child_id,
            } => debug!(parent_id, child_id, "Node linked"),
            Event::TagGroupCreate {
                node_id,
                taggroup_id,
                custom_type,
            } => self.on_taggroup_create(node_id, taggroup_id, custom_type),
            Event::TagGroupDestroy {
                node_id,
                taggroup_id,
            } => self.on_taggroup_destroy(node_id, taggroup_id),
            Event::TagCreate {
                node_id,
                taggroup_id,
                tag_id,
                data_type,
                count,
                custom_type,
            } => self.on_tag_create(node_id, taggroup_id, tag_id, data_type, count, custom_type),
            Event::TagDestroy {
                node_id,
                taggroup_id,
                tag_id,
            } => self.on_tag_destroy(node_id, taggroup_id, tag_id),
            Event::TagSetValue {
                node_id,
                taggroup_id,
                tag_id,
                value,
            } => self.on_tag_set_value(node_id, taggroup_id, tag_id, value),
            Event::LayerCreate {
                node_id,
                layer_id,
                data_type,
                count,
                custom_type,
                ..
            } => self.on_layer_create(node_id, layer_id, data_type, count, custom_type),
            Event::LayerSetValue {
                node_id,
                layer_id,
                item_id,
                value,
            } => self.on_layer_set_value(node_id, layer_id, item_id, value),
            Event::LayerUnsetValue {
                node_id,
                layer_id,
                item_id,
            } => self.on_layer_unset_value(node_id, layer_id, item_id),
        }
        Flow::Continue
    }

    fn on_connect_accept(&mut self, session_id: SessionId, user_id: UserId, avatar_id: NodeId) {
        if self.state != ConnState::Unconnected {
            warn!(session_id, "Duplicate connect accept ignored");
            return;
        }
        info!(session_id, user_id, avatar_id, role = %self.cfg.role, "Connected");
        self.state = ConnState::Connected {
            session_id,
            user_id,
            avatar_id,
        };

        self.outbox.push(Request::NodeSubscribe { node_id: avatar_id });
        match self.cfg.role {
            Role::Receiver => self.outbox.push(Request::NodeSubscribe {
                node_id: node_id::SCENE_PARENT,
            }),
            Role::Sender => {
                self.outbox.push(Request::NodeCreate {
                    custom_type: custom_type::SCENE_NODE,
                });
                for _ in 0..self.cfg.sender_count {
                    self.outbox.push(Request::NodeCreate {
                        custom_type: custom_type::SENDER_NODE,
                    });
                }
            }
        }
    }

    fn on_node_create(&mut self, id: NodeId, parent_id: NodeId, user_id: UserId, ct: u16) {
        let Some((own_user, avatar_id)) = self.own_ids() else {
            warn!(node_id = id, "Node create before connect accept");
            return;
        };
        if self.lookup.contains(id) {
            debug!(node_id = id, "Node already mirrored");
            return;
        }

        match self.cfg.role {
            Role::Sender => {
                if user_id != own_user || parent_id != avatar_id {
                    debug!(node_id = id, user_id, parent_id, "Foreign node ignored");
                    return;
                }
                match ct {
                    custom_type::SCENE_NODE => {
                        if self.mirror_scene(id, user_id).is_some() {
                            self.outbox.push(Request::NodeLink {
                                parent_id: node_id::SCENE_PARENT,
                                child_id: id,
                            });
                            self.outbox.push(Request::NodeSubscribe { node_id: id });
                            self.outbox.push(Request::TagGroupCreate {
                                node_id: id,
                                custom_type: custom_type::SCENE_TAGGROUP,
                            });
                        }
                    }
                    custom_type::SENDER_NODE => {
                        if let Some(scene_id) = self.mirror_sender(id, user_id) {
                            self.outbox.push(Request::NodeSubscribe { node_id: id });
                            self.outbox.push(Request::NodeLink {
                                parent_id: scene_id,
                                child_id: id,
                            });
                            self.outbox.push(Request::TagGroupCreate {
                                node_id: id,
                                custom_type: custom_type::SENDER_TAGGROUP,
                            });
                            self.outbox
                                .push(Request::layer_create(id, shape::PARTICLE_LAYER));
                        }
                    }
                    _ => debug!(node_id = id, custom_type = ct, "Node type ignored"),
                }
            }
            Role::Receiver => {
                let subscribed = match ct {
                    custom_type::SCENE_NODE if parent_id == node_id::SCENE_PARENT => {
                        self.mirror_scene(id, user_id).is_some()
                    }
                    custom_type::SENDER_NODE => self.mirror_sender_under(id, parent_id, user_id),
                    custom_type::PARTICLE_NODE => self.mirror_particle(id, parent_id, user_id),
                    _ => {
                        debug!(node_id = id, custom_type = ct, parent_id, "Node ignored");
                        false
                    }
                };
                if subscribed {
                    self.outbox.push(Request::NodeSubscribe { node_id: id });
                }
            }
        }
    }

    /// Inserts a node and registers it; undoes the insert if registration fails.
    fn register(
        &mut self,
        id: NodeId,
        user_id: UserId,
        parent: Option<NodeHandle>,
        kind: NodeKind,
    ) -> Option<NodeHandle> {
        let name = kind.name();
        let handle = self.graph.insert(id, user_id, parent, kind);
        if let Err(e) = self.lookup.add(id, handle) {
            error!(node_id = id, error = %e, "Cannot register node");
            self.graph.remove_subtree(handle);
            return None;
        }
        info!(node_id = id, kind = name, "Node mirrored");
        Some(handle)
    }

    fn mirror_scene(&mut self, id: NodeId, user_id: UserId) -> Option<NodeHandle> {
        if let Some(existing) = self.graph.scene().and_then(|h| self.graph.get(h)) {
            debug!(node_id = id, scene = existing.id, "Scene already known");
            return None;
        }
        self.register(id, user_id, None, NodeKind::Scene(SceneNode::default()))
    }

    /// Mirrors a sender node under the scene and binds it. Returns the scene id.
    fn mirror_sender(&mut self, id: NodeId, user_id: UserId) -> Option<NodeId> {
        let scene = self.graph.scene()?;
        let scene_id = self.graph.get(scene)?.id;

        if self.graph.sender_children(scene) >= usize::from(self.cfg.sender_count) {
            debug!(node_id = id, "Sender quota reached");
            return None;
        }
        let Some(index) = self.bindings.iter().position(Option::is_none) else {
            error!(node_id = id, "No free sender to bind");
            return None;
        };

        let kind = NodeKind::Sender(SenderNode {
            sender: Some(index),
            ..Default::default()
        });
        let handle = self.register(id, user_id, Some(scene), kind)?;
        self.bindings[index] = Some(handle);
        info!(node_id = id, sender = index, "Sender bound");
        Some(scene_id)
    }

    fn mirror_sender_under(&mut self, id: NodeId, parent_id: NodeId, user_id: UserId) -> bool {
        let scene_id = self
            .graph
            .scene()
            .and_then(|h| self.graph.get(h))
            .map(|n| n.id);
        if scene_id != Some(parent_id) {
            debug!(node_id = id, parent_id, "Sender outside the scene ignored");
            return false;
        }
        self.mirror_sender(id, user_id).is_some()
    }

    fn mirror_particle(&mut self, id: NodeId, parent_id: NodeId, user_id: UserId) -> bool {
        let parent = self
            .lookup
            .find(parent_id)
            .filter(|&h| matches!(self.graph.get(h).map(|n| &n.kind), Some(NodeKind::Sender(_))));
        let Some(parent) = parent else {
            debug!(node_id = id, parent_id, "Particle outside a sender ignored");
            return false;
        };
        self.register(
            id,
            user_id,
            Some(parent),
            NodeKind::Particle(ParticleNode::default()),
        )
        .is_some()
    }

    fn on_node_destroy(&mut self, id: NodeId) {
        let Some(handle) = self.lookup.find(id) else {
            debug!(node_id = id, "Destroy of unmirrored node");
            return;
        };
        for node in self.graph.remove_subtree(handle) {
            self.lookup.remove(node.id);
            if let NodeKind::Sender(SenderNode {
                sender: Some(index),
                ..
            }) = node.kind
            {
                self.unbind(index);
            }
            info!(node_id = node.id, kind = node.kind.name(), "Node removed");
        }
    }

    fn unbind(&mut self, index: usize) {
        if let Some(b) = self.bindings.get_mut(index) {
            *b = None;
        }
        if let Some(p) = self.last_published.get_mut(index) {
            *p = None;
        }
        if let Some(sender) = self.pool.get(index) {
            sender.timer.stop();
            if let Some(mut rec) = sender.received() {
                rec.reset();
            }
        }
    }

    fn on_taggroup_create(&mut self, id: NodeId, taggroup_id: TagGroupId, ct: u16) {
        let Some(handle) = self.resolve(id) else {
            return;
        };
        let Some(node) = self.graph.get_mut(handle) else {
            return;
        };
        let role = self.cfg.role;

        let tags: &[_] = match (&mut node.kind, ct) {
            (NodeKind::Scene(s), custom_type::SCENE_TAGGROUP) if s.taggroup_id.is_none() => {
                s.taggroup_id = Some(taggroup_id);
                &[shape::SENDER_COUNT, shape::FRAME]
            }
            (NodeKind::Sender(s), custom_type::SENDER_TAGGROUP) if s.taggroup_id.is_none() => {
                s.taggroup_id = Some(taggroup_id);
                &[
                    shape::FRAME,
                    shape::PARTICLE_COUNT,
                    shape::SENDER_ID,
                    shape::POSITION,
                ]
            }
            (NodeKind::Particle(p), custom_type::PARTICLE_TAGGROUP) if p.taggroup_id.is_none() => {
                p.taggroup_id = Some(taggroup_id);
                &[]
            }
            (kind, _) => {
                debug!(node_id = id, taggroup_id, custom_type = ct, kind = kind.name(), "Tag group ignored");
                return;
            }
        };
        debug!(node_id = id, taggroup_id, "Tag group mirrored");

        self.outbox.push(Request::TagGroupSubscribe {
            node_id: id,
            taggroup_id,
        });
        if role == Role::Sender {
            self.outbox.extend(
                tags.iter()
                    .map(|&shape| Request::tag_create(id, taggroup_id, shape)),
            );
        }
    }

    fn on_taggroup_destroy(&mut self, id: NodeId, taggroup_id: TagGroupId) {
        let Some(node) = self.resolve(id).and_then(|h| self.graph.get_mut(h)) else {
            return;
        };
        if node.kind.taggroup_id() != Some(taggroup_id) {
            return;
        }
        match &mut node.kind {
            NodeKind::Scene(s) => {
                *s = SceneNode::default();
            }
            NodeKind::Sender(s) => {
                *s = SenderNode {
                    sender: s.sender,
                    layer_id: s.layer_id,
                    ..Default::default()
                };
            }
            NodeKind::Particle(p) => *p = ParticleNode::default(),
        }
        debug!(node_id = id, taggroup_id, "Tag group removed");
    }

    fn on_tag_create(
        &mut self,
        id: NodeId,
        taggroup_id: TagGroupId,
        tag_id: TagId,
        data_type: DataType,
        count: u8,
        ct: u16,
    ) {
        let Some(handle) = self.resolve(id) else {
            return;
        };
        let Some(node) = self.graph.get_mut(handle) else {
            return;
        };
        if node.kind.taggroup_id() != Some(taggroup_id) {
            debug!(node_id = id, taggroup_id, tag_id, "Tag in unknown tag group ignored");
            return;
        }
        let is = |s: ValueShape| s.matches(data_type, count, ct);
        let sending = self.cfg.role == Role::Sender;
        let set = |value: Value| Request::TagSetValue {
            node_id: id,
            taggroup_id,
            tag_id,
            value,
        };

        match &mut node.kind {
            NodeKind::Scene(s) => {
                if is(shape::SENDER_COUNT) {
                    s.sender_count_tag = Some(tag_id);
                    if sending {
                        self.outbox
                            .push(set(Value::UInt16(vec![self.cfg.sender_count])));
                    }
                } else if is(shape::FRAME) {
                    s.frame_tag = Some(tag_id);
                } else {
                    debug!(node_id = id, tag_id, custom_type = ct, "Scene tag ignored");
                    return;
                }
            }
            NodeKind::Sender(s) => {
                let sender = s.sender.and_then(|i| self.pool.get(i));
                if is(shape::FRAME) {
                    s.frame_tag = Some(tag_id);
                    if let (true, Some(sender)) = (sending, sender) {
                        let start = -i64::from(self.cfg.preroll_frames);
                        if sender.timer.start(start, self.pool.frame_count()) {
                            info!(node_id = id, sender = sender.id, preroll = self.cfg.preroll_frames, "Sender timer started");
                        }
                    }
                } else if is(shape::PARTICLE_COUNT) {
                    s.particle_count_tag = Some(tag_id);
                    if sending {
                        let n = self.pool.data().particle_count().min(u16::MAX as usize) as u16;
                        self.outbox.push(set(Value::UInt16(vec![n])));
                    }
                } else if is(shape::SENDER_ID) {
                    s.sender_id_tag = Some(tag_id);
                    if let (true, Some(sender)) = (sending, sender) {
                        self.outbox.push(set(Value::UInt16(vec![sender.id])));
                    }
                } else if is(shape::POSITION) {
                    s.position_tag = Some(tag_id);
                    if let (true, Some(sender)) = (sending, sender) {
                        self.outbox.push(set(Value::vec3(sender.position())));
                    }
                } else {
                    debug!(node_id = id, tag_id, custom_type = ct, "Sender tag ignored");
                    return;
                }
            }
            NodeKind::Particle(p) => {
                if is(shape::PARTICLE_ID) {
                    p.particle_id_tag = Some(tag_id);
                } else if is(shape::POSITION) {
                    p.position_tag = Some(tag_id);
                } else {
                    debug!(node_id = id, tag_id, custom_type = ct, "Particle tag ignored");
                    return;
                }
            }
        }
        debug!(node_id = id, taggroup_id, tag_id, custom_type = ct, "Tag mirrored");
    }

    fn on_tag_destroy(&mut self, id: NodeId, taggroup_id: TagGroupId, tag_id: TagId) {
        let Some(node) = self.resolve(id).and_then(|h| self.graph.get_mut(h)) else {
            return;
        };
        if node.kind.taggroup_id() != Some(taggroup_id) {
            return;
        }
        let clear = |slot: &mut Option<TagId>| {
            if *slot == Some(tag_id) {
                *slot = None;
            }
        };
        match &mut node.kind {
            NodeKind::Scene(s) => {
                clear(&mut s.sender_count_tag);
                clear(&mut s.frame_tag);
            }
            NodeKind::Sender(s) => {
                clear(&mut s.frame_tag);
                clear(&mut s.particle_count_tag);
                clear(&mut s.sender_id_tag);
                clear(&mut s.position_tag);
            }
            NodeKind::Particle(p) => {
                clear(&mut p.particle_id_tag);
                clear(&mut p.position_tag);
            }
        }
    }

    fn on_tag_set_value(&mut self, id: NodeId, taggroup_id: TagGroupId, tag_id: TagId, value: Value) {
        let Some(handle) = self.resolve(id) else {
            return;
        };
        let Some(node) = self.graph.get_mut(handle) else {
            return;
        };
        if node.kind.taggroup_id() != Some(taggroup_id) {
            return;
        }
        let tag = Some(tag_id);
        let mut frame_for: Vec<usize> = Vec::new();
        let mut frame_value = None;
        let mut scene_frame = false;

        match &mut node.kind {
            NodeKind::Scene(s) => {
                if tag == s.frame_tag {
                    frame_value = value.as_int();
                    s.frame = frame_value;
                    scene_frame = true;
                } else if tag == s.sender_count_tag {
                    s.sender_count = value.as_u16();
                }
            }
            NodeKind::Sender(s) => {
                if tag == s.frame_tag {
                    frame_value = value.as_int();
                    s.frame = frame_value;
                    frame_for.extend(s.sender);
                } else if tag == s.particle_count_tag {
                    s.particle_count = value.as_u16();
                } else if tag == s.sender_id_tag {
                    s.sender_id = value.as_u16();
                } else if tag == s.position_tag {
                    s.position = value.as_vec3();
                    if let (Some(pos), Some(sender)) =
                        (s.position, s.sender.and_then(|i| self.pool.get(i)))
                    {
                        sender.set_position(pos);
                    }
                }
            }
            NodeKind::Particle(p) => {
                if tag == p.particle_id_tag {
                    p.particle_id = value.as_u16();
                } else if tag == p.position_tag {
                    p.position = value.as_vec3();
                }
            }
        }

        if self.cfg.role != Role::Receiver {
            return;
        }
        let Some(frame) = frame_value else {
            return;
        };
        if scene_frame {
            frame_for = self.bound_children(handle);
        }
        for index in frame_for {
            self.frame_received(index, frame);
        }
    }

    /// Sender role objects bound to sender nodes directly under `parent`.
    fn bound_children(&self, parent: NodeHandle) -> Vec<usize> {
        let Some(node) = self.graph.get(parent) else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter_map(|&c| match self.graph.get(c).map(|n| &n.kind) {
                Some(NodeKind::Sender(SenderNode {
                    sender: Some(i), ..
                })) => Some(*i),
                _ => None,
            })
            .collect()
    }

    /// Remote sender advertised `frame`: start the clock if needed, then
    /// record it as the claimed frame for matching positions.
    fn frame_received(&self, index: usize, frame: i64) {
        let Some(sender) = self.pool.get(index) else {
            return;
        };
        if sender.timer.start(frame, self.pool.frame_count()) {
            info!(sender = sender.id, frame, "Receiver timer started");
        }
        if let Some(mut rec) = sender.received() {
            rec.rec_frame = frame as i32;
        }
    }

    fn on_layer_create(&mut self, id: NodeId, layer_id: LayerId, data_type: DataType, count: u8, ct: u16) {
        let Some(node) = self.resolve(id).and_then(|h| self.graph.get_mut(h)) else {
            return;
        };
        match &mut node.kind {
            NodeKind::Sender(s)
                if s.layer_id.is_none() && shape::PARTICLE_LAYER.matches(data_type, count, ct) =>
            {
                s.layer_id = Some(layer_id);
                debug!(node_id = id, layer_id, "Particle layer mirrored");
                if self.cfg.role == Role::Receiver {
                    self.outbox.push(Request::LayerSubscribe {
                        node_id: id,
                        layer_id,
                    });
                }
            }
            kind => {
                debug!(node_id = id, layer_id, custom_type = ct, kind = kind.name(), "Layer ignored")
            }
        }
    }

    /// Bound sender index of the sender node owning layer `layer_id`.
    fn layer_sender(&self, id: NodeId, layer_id: LayerId) -> Option<usize> {
        let node = self.resolve(id).and_then(|h| self.graph.get(h))?;
        match &node.kind {
            NodeKind::Sender(s) if s.layer_id == Some(layer_id) => s.sender,
            _ => {
                debug!(node_id = id, layer_id, "Value for unknown layer ignored");
                None
            }
        }
    }

    fn on_layer_set_value(&mut self, id: NodeId, layer_id: LayerId, item_id: ItemId, value: Value) {
        if self.cfg.role != Role::Receiver {
            return;
        }
        let Some(index) = self.layer_sender(id, layer_id) else {
            return;
        };
        let Some(pos) = value.as_vec3() else {
            warn!(node_id = id, layer_id, item_id, "Layer value is not a position");
            return;
        };
        let Some(sender) = self.pool.get(index) else {
            return;
        };

        let timer = sender.timer.snapshot();
        if !timer.running {
            debug!(sender = sender.id, item_id, "Layer value before the sender clock runs");
            return;
        }
        let frame = timer.frame;
        let receipt = match sender.received() {
            Some(mut rec) => rec.classify_position(self.pool.data(), item_id as usize, pos, frame),
            None => None,
        };
        if receipt == Some(Receipt::Delayed) {
            debug!(sender = sender.id, item_id, frame, "Delayed particle");
        }
    }

    fn on_layer_unset_value(&mut self, id: NodeId, layer_id: LayerId, item_id: ItemId) {
        if self.cfg.role != Role::Receiver {
            return;
        }
        let Some(sender) = self
            .layer_sender(id, layer_id)
            .and_then(|i| self.pool.get(i))
        else {
            return;
        };
        if let Some(mut rec) = sender.received() {
            rec.unset(item_id as usize);
        }
    }

    /// Queues this tick's frame data for every bound, running sender.
    pub fn publish_tick(&mut self) {
        if self.cfg.role != Role::Sender || self.closing || self.own_ids().is_none() {
            return;
        }
        let mut scene_frame = None;

        for index in 0..self.bindings.len() {
            let Some(node) = self.bindings[index].and_then(|h| self.graph.get(h)) else {
                continue;
            };
            let NodeKind::Sender(s) = &node.kind else {
                continue;
            };
            let Some(target) = PublishTarget::for_sender(node.id, s) else {
                continue;
            };
            let Some(sender) = self.pool.get(index) else {
                continue;
            };

            let state = sender.timer.snapshot();
            if !publish::is_publishable(&state) || self.last_published[index] == Some(state.total_frame) {
                continue;
            }
            self.last_published[index] = Some(state.total_frame);
            self.outbox
                .extend(publish::frame_requests(&target, self.pool.data(), &state));
            scene_frame.get_or_insert(state.frame);
        }

        let Some(frame) = scene_frame else {
            return;
        };
        let scene = self.graph.scene().and_then(|h| self.graph.get(h));
        if let Some((node_id, NodeKind::Scene(s))) = scene.map(|n| (n.id, &n.kind)) {
            if let (Some(taggroup_id), Some(tag_id)) = (s.taggroup_id, s.frame_tag) {
                self.outbox.push(Request::TagSetValue {
                    node_id,
                    taggroup_id,
                    tag_id,
                    value: Value::UInt16(vec![frame as u16]),
                });
            }
        }
    }

    /// Queues teardown: own sender nodes are destroyed (sender role), then
    /// the connection is closed. The server confirms with a terminate event.
    pub fn request_shutdown(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        if self.own_ids().is_none() {
            return;
        }
        if self.cfg.role == Role::Sender {
            let ids: Vec<NodeId> = self
                .bindings
                .iter()
                .flatten()
                .filter_map(|&h| self.graph.get(h).map(|n| n.id))
                .collect();
            for node_id in ids {
                self.outbox.push(Request::NodeDestroy { node_id });
            }
        }
        info!("Disconnecting");
        self.outbox.push(Request::Terminate);
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}
