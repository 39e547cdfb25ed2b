//! Sender-role publishing.
//!
//! Turns one timer reading into the requests that replay that frame of the
//! reference data: the frame tag value followed by one layer item per active
//! particle. When the animation wraps to frame 0 every item is unset first so
//! receivers drop the previous loop.

use particle_shared::node::SenderNode;
use particle_shared::particle_data::{ParticleState, RefParticleData};
use particle_shared::protocol::{LayerId, NodeId, Request, TagGroupId, TagId, Value};
use particle_shared::timer::TimerState;

/// Resource ids a sender node needs before it can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishTarget {
    pub node_id: NodeId,
    pub taggroup_id: TagGroupId,
    pub frame_tag: TagId,
    pub layer_id: LayerId,
}

impl PublishTarget {
    /// `None` until the tag group, frame tag and layer all exist.
    pub fn for_sender(node_id: NodeId, node: &SenderNode) -> Option<Self> {
        Some(Self {
            node_id,
            taggroup_id: node.taggroup_id?,
            frame_tag: node.frame_tag?,
            layer_id: node.layer_id?,
        })
    }
}

/// Whether `state` is a frame that should go out at all.
pub fn is_publishable(state: &TimerState) -> bool {
    state.running && state.total_frame >= 0 && state.frame >= 0
}

/// Requests replaying frame `state.frame` of `data` into `target`.
pub fn frame_requests(
    target: &PublishTarget,
    data: &RefParticleData,
    state: &TimerState,
) -> Vec<Request> {
    let mut out = Vec::new();
    if !is_publishable(state) {
        return out;
    }
    let frame = state.frame as usize;

    if frame == 0 {
        out.extend((0..data.particle_count()).map(|item| Request::LayerUnsetValue {
            node_id: target.node_id,
            layer_id: target.layer_id,
            item_id: item as u32,
        }));
    }

    out.push(Request::TagSetValue {
        node_id: target.node_id,
        taggroup_id: target.taggroup_id,
        tag_id: target.frame_tag,
        value: Value::UInt16(vec![frame as u16]),
    });

    for particle in data.particles() {
        let Some(s) = particle.states.get(frame) else {
            continue;
        };
        if s.state == ParticleState::Active {
            out.push(Request::LayerSetValue {
                node_id: target.node_id,
                layer_id: target.layer_id,
                item_id: particle.id as u32,
                value: Value::vec3(s.pos),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use particle_shared::math::Vec3;

    const TARGET: PublishTarget = PublishTarget {
        node_id: 65_540,
        taggroup_id: 0,
        frame_tag: 1,
        layer_id: 2,
    };

    fn data() -> RefParticleData {
        // particle 0 born at 2, particle 1 born at 1 and dead at 3
        let a = vec![
            Vec3::ZERO,
            Vec3::ZERO,
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
        ];
        let b = vec![
            Vec3::ZERO,
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
        ];
        RefParticleData::from_tracks(&[a, b])
    }

    fn running(total: i64, frame: i32) -> TimerState {
        TimerState {
            frame,
            total_frame: total,
            running: true,
        }
    }

    fn layer_items(reqs: &[Request]) -> Vec<u32> {
        reqs.iter()
            .filter_map(|r| match r {
                Request::LayerSetValue { item_id, .. } => Some(*item_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn only_active_particles_are_sent() {
        let d = data();
        assert_eq!(layer_items(&frame_requests(&TARGET, &d, &running(2, 2))), vec![0, 1]);
        assert_eq!(layer_items(&frame_requests(&TARGET, &d, &running(3, 3))), vec![0]);
        assert!(layer_items(&frame_requests(&TARGET, &d, &running(1, 1))).contains(&1));
    }

    #[test]
    fn frame_tag_precedes_layer_values() {
        let reqs = frame_requests(&TARGET, &data(), &running(2, 2));
        assert!(matches!(
            &reqs[0],
            Request::TagSetValue { tag_id: 1, value: Value::UInt16(v), .. } if v == &vec![2]
        ));
    }

    #[test]
    fn wrap_to_frame_zero_unsets_everything_first() {
        let reqs = frame_requests(&TARGET, &data(), &running(4, 0));
        assert!(matches!(reqs[0], Request::LayerUnsetValue { item_id: 0, .. }));
        assert!(matches!(reqs[1], Request::LayerUnsetValue { item_id: 1, .. }));
        assert!(matches!(reqs[2], Request::TagSetValue { .. }));
    }

    #[test]
    fn preroll_and_stopped_timers_publish_nothing() {
        let d = data();
        assert!(frame_requests(&TARGET, &d, &running(-3, 0)).is_empty());
        assert!(frame_requests(&TARGET, &d, &TimerState::default()).is_empty());
    }

    #[test]
    fn target_needs_all_resources() {
        let mut node = SenderNode {
            taggroup_id: Some(0),
            frame_tag: Some(1),
            ..Default::default()
        };
        assert_eq!(PublishTarget::for_sender(65_540, &node), None);
        node.layer_id = Some(2);
        assert_eq!(PublishTarget::for_sender(65_540, &node), Some(TARGET));
    }
}
