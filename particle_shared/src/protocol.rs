//! Shared-scene protocol messages.
//!
//! Clients send [`Request`]s, the server answers and fans out [`Event`]s.
//! Messages are plain serde enums; framing lives in [`crate::net`].
//! `Real32` payloads travel as IEEE-754 bit patterns so positions replayed
//! from the reference data arrive bit-identical.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::math::Vec3;

pub type NodeId = u32;
pub type TagGroupId = u16;
pub type TagId = u16;
pub type LayerId = u16;
pub type SessionId = u32;
pub type UserId = u16;
/// Layer item index; one item per particle.
pub type ItemId = u32;

/// Protocol version checked on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default server port.
pub const DEFAULT_PORT: u16 = 12345;

/// Well-known node ids.
pub mod node_id {
    use super::NodeId;

    pub const ROOT: NodeId = 0;
    pub const AVATAR_PARENT: NodeId = 1;
    pub const USER_PARENT: NodeId = 2;
    pub const SCENE_PARENT: NodeId = 3;
    /// First id handed out for client-created nodes.
    pub const FIRST_DYNAMIC: NodeId = 65_536;
}

/// Application custom types of nodes, tag groups, tags and layers.
pub mod custom_type {
    pub const SCENE_NODE: u16 = 100;
    pub const SENDER_NODE: u16 = 101;
    pub const PARTICLE_NODE: u16 = 102;

    pub const SCENE_TAGGROUP: u16 = 200;
    pub const SENDER_TAGGROUP: u16 = 201;
    pub const PARTICLE_TAGGROUP: u16 = 202;

    pub const FRAME_TAG: u16 = 300;
    pub const SENDER_COUNT_TAG: u16 = 301;
    pub const POSITION_TAG: u16 = 302;
    pub const PARTICLE_COUNT_TAG: u16 = 303;
    pub const SENDER_ID_TAG: u16 = 304;
    pub const PARTICLE_ID_TAG: u16 = 305;

    pub const PARTICLE_LAYER: u16 = 400;
}

/// Element type of a tag or layer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    UInt16,
    Int32,
    Real32,
}

/// Shape of a tag or layer: element type, element count, custom type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueShape {
    pub data_type: DataType,
    pub count: u8,
    pub custom_type: u16,
}

impl ValueShape {
    pub const fn new(data_type: DataType, count: u8, custom_type: u16) -> Self {
        Self {
            data_type,
            count,
            custom_type,
        }
    }

    pub fn matches(&self, data_type: DataType, count: u8, custom_type: u16) -> bool {
        self.data_type == data_type && self.count == count && self.custom_type == custom_type
    }
}

pub mod shape {
    //! Tags and layers the particle scene uses.

    use super::custom_type as ct;
    use super::{DataType, ValueShape};

    pub const FRAME: ValueShape = ValueShape::new(DataType::UInt16, 1, ct::FRAME_TAG);
    pub const SENDER_COUNT: ValueShape = ValueShape::new(DataType::UInt16, 1, ct::SENDER_COUNT_TAG);
    pub const PARTICLE_COUNT: ValueShape =
        ValueShape::new(DataType::UInt16, 1, ct::PARTICLE_COUNT_TAG);
    pub const SENDER_ID: ValueShape = ValueShape::new(DataType::UInt16, 1, ct::SENDER_ID_TAG);
    pub const PARTICLE_ID: ValueShape = ValueShape::new(DataType::UInt16, 1, ct::PARTICLE_ID_TAG);
    pub const POSITION: ValueShape = ValueShape::new(DataType::Real32, 3, ct::POSITION_TAG);
    pub const PARTICLE_LAYER: ValueShape = ValueShape::new(DataType::Real32, 3, ct::PARTICLE_LAYER);
}

/// A tag or layer-item value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    Real32(#[serde(with = "real32_bits")] Vec<f32>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::UInt16(_) => DataType::UInt16,
            Value::Int32(_) => DataType::Int32,
            Value::Real32(_) => DataType::Real32,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Value::UInt16(v) => v.len(),
            Value::Int32(v) => v.len(),
            Value::Real32(v) => v.len(),
        }
    }

    pub fn vec3(v: Vec3) -> Self {
        Value::Real32(v.to_array().to_vec())
    }

    /// First element of an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::UInt16(v) => v.first().map(|&x| i64::from(x)),
            Value::Int32(v) => v.first().map(|&x| i64::from(x)),
            Value::Real32(_) => None,
        }
    }

    /// First element as a `u16`; `None` if it does not fit.
    pub fn as_u16(&self) -> Option<u16> {
        self.as_int().and_then(|v| u16::try_from(v).ok())
    }

    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            Value::Real32(v) => Vec3::from_slice(v),
            _ => None,
        }
    }
}

mod real32_bits {
    use super::*;

    pub fn serialize<S: Serializer>(values: &[f32], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(values.iter().map(|f| f.to_bits()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f32>, D::Error> {
        let bits = Vec::<u32>::deserialize(d)?;
        Ok(bits.into_iter().map(f32::from_bits).collect())
    }
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Connect {
        protocol: u32,
        username: String,
        password: String,
        secure: bool,
    },
    Terminate,

    /// Creates a node under the caller's avatar.
    NodeCreate {
        custom_type: u16,
    },
    NodeDestroy {
        node_id: NodeId,
    },
    NodeLink {
        parent_id: NodeId,
        child_id: NodeId,
    },
    NodeSubscribe {
        node_id: NodeId,
    },

    TagGroupCreate {
        node_id: NodeId,
        custom_type: u16,
    },
    TagGroupSubscribe {
        node_id: NodeId,
        taggroup_id: TagGroupId,
    },
    TagCreate {
        node_id: NodeId,
        taggroup_id: TagGroupId,
        data_type: DataType,
        count: u8,
        custom_type: u16,
    },
    TagSetValue {
        node_id: NodeId,
        taggroup_id: TagGroupId,
        tag_id: TagId,
        value: Value,
    },

    LayerCreate {
        node_id: NodeId,
        parent_layer_id: Option<LayerId>,
        data_type: DataType,
        count: u8,
        custom_type: u16,
    },
    LayerSubscribe {
        node_id: NodeId,
        layer_id: LayerId,
    },
    LayerSetValue {
        node_id: NodeId,
        layer_id: LayerId,
        item_id: ItemId,
        value: Value,
    },
    LayerUnsetValue {
        node_id: NodeId,
        layer_id: LayerId,
        item_id: ItemId,
    },
}

impl Request {
    pub fn tag_create(node_id: NodeId, taggroup_id: TagGroupId, shape: ValueShape) -> Self {
        Request::TagCreate {
            node_id,
            taggroup_id,
            data_type: shape.data_type,
            count: shape.count,
            custom_type: shape.custom_type,
        }
    }

    pub fn layer_create(node_id: NodeId, shape: ValueShape) -> Self {
        Request::LayerCreate {
            node_id,
            parent_layer_id: None,
            data_type: shape.data_type,
            count: shape.count,
            custom_type: shape.custom_type,
        }
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ConnectAccept {
        session_id: SessionId,
        user_id: UserId,
        avatar_id: NodeId,
    },
    ConnectTerminate {
        reason: String,
    },

    NodeCreate {
        node_id: NodeId,
        parent_id: NodeId,
        user_id: UserId,
        custom_type: u16,
    },
    NodeDestroy {
        node_id: NodeId,
    },
    NodeLink {
        parent_id: NodeId,
        child_id: NodeId,
    },

    TagGroupCreate {
        node_id: NodeId,
        taggroup_id: TagGroupId,
        custom_type: u16,
    },
    TagGroupDestroy {
        node_id: NodeId,
        taggroup_id: TagGroupId,
    },
    TagCreate {
        node_id: NodeId,
        taggroup_id: TagGroupId,
        tag_id: TagId,
        data_type: DataType,
        count: u8,
        custom_type: u16,
    },
    TagDestroy {
        node_id: NodeId,
        taggroup_id: TagGroupId,
        tag_id: TagId,
    },
    TagSetValue {
        node_id: NodeId,
        taggroup_id: TagGroupId,
        tag_id: TagId,
        value: Value,
    },

    LayerCreate {
        node_id: NodeId,
        parent_layer_id: Option<LayerId>,
        layer_id: LayerId,
        data_type: DataType,
        count: u8,
        custom_type: u16,
    },
    LayerSetValue {
        node_id: NodeId,
        layer_id: LayerId,
        item_id: ItemId,
        value: Value,
    },
    LayerUnsetValue {
        node_id: NodeId,
        layer_id: LayerId,
        item_id: ItemId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real32_values_keep_their_bits() {
        let odd = [0.1f32, -0.0, f32::MIN_POSITIVE / 2.0, 1.0e-7 * 3.0];
        let ev = Event::LayerSetValue {
            node_id: 70_000,
            layer_id: 1,
            item_id: 4,
            value: Value::Real32(odd.to_vec()),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        let Event::LayerSetValue {
            value: Value::Real32(v),
            ..
        } = back
        else {
            panic!("wrong variant: {back:?}");
        };
        let bits: Vec<u32> = v.iter().map(|f| f.to_bits()).collect();
        let want: Vec<u32> = odd.iter().map(|f| f.to_bits()).collect();
        assert_eq!(bits, want);
    }

    #[test]
    fn value_accessors() {
        assert_eq!(Value::UInt16(vec![7]).as_int(), Some(7));
        assert_eq!(Value::Int32(vec![-3, 1]).as_int(), Some(-3));
        assert_eq!(Value::Real32(vec![1.0]).as_int(), None);
        assert_eq!(Value::Int32(vec![70_000]).as_u16(), None);
        assert_eq!(Value::Int32(vec![-1]).as_u16(), None);
        assert_eq!(Value::Int32(vec![12]).as_u16(), Some(12));
        assert_eq!(
            Value::vec3(Vec3::new(1.0, 2.0, 3.0)).as_vec3(),
            Some(Vec3::new(1.0, 2.0, 3.0))
        );
        assert_eq!(Value::Real32(vec![1.0, 2.0]).as_vec3(), None);
        assert_eq!(Value::UInt16(vec![1, 2]).count(), 2);
    }

    #[test]
    fn value_shape_matching() {
        assert!(shape::FRAME.matches(DataType::UInt16, 1, custom_type::FRAME_TAG));
        assert!(!shape::FRAME.matches(DataType::Int32, 1, custom_type::FRAME_TAG));
        assert!(!shape::POSITION.matches(DataType::Real32, 1, custom_type::POSITION_TAG));
        match Request::tag_create(5, 2, shape::SENDER_ID) {
            Request::TagCreate {
                data_type,
                count,
                custom_type,
                ..
            } => assert!(shape::SENDER_ID.matches(data_type, count, custom_type)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
