use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Private,
    Group,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }
}

/// One structured piece of a message. Unknown segment types are carried
/// through untouched so newer gateway features survive the round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "deserialize_segment_data")]
    pub data: BTreeMap<String, String>,
}

impl Segment {
    pub fn new(kind: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text", BTreeMap::from([("text".to_string(), text.into())]))
    }

    pub fn image(file: impl Into<String>) -> Self {
        Self::new("image", BTreeMap::from([("file".to_string(), file.into())]))
    }

    pub fn at(user_id: i64) -> Self {
        Self::new("at", BTreeMap::from([("qq".to_string(), user_id.to_string())]))
    }

    pub fn reply(message_id: i64) -> Self {
        Self::new(
            "reply",
            BTreeMap::from([("id".to_string(), message_id.to_string())]),
        )
    }
}

// Gateway payloads carry numbers and booleans in segment data; the wire
// contract is string-to-string, so scalars are stringified on the way in.
fn deserialize_segment_data<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    let mut data = BTreeMap::new();
    for (key, value) in raw {
        let rendered = match value {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        data.insert(key, rendered);
    }
    Ok(data)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub card: String,
    #[serde(default)]
    pub role: String,
}

/// A parsed chat event handed over by the upstream gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub post_type: String,
    pub message_type: MessageKind,
    #[serde(default)]
    pub message_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub group_id: i64,
    #[serde(default)]
    pub raw_message: String,
    #[serde(default, rename = "message")]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub sender: Sender,
}

impl MessageEvent {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn is_private(&self) -> bool {
        self.message_type == MessageKind::Private
    }

    pub fn is_group(&self) -> bool {
        self.message_type == MessageKind::Group
    }

    pub fn to_proto(&self) -> proto::MessageEvent {
        proto::MessageEvent {
            message_id: self.message_id.to_string(),
            user_id: self.user_id,
            group_id: self.group_id,
            message_type: self.message_type.as_str().to_string(),
            raw_message: self.raw_message.clone(),
            segments: segments_to_proto(&self.segments),
            sender: Some(proto::UserInfo {
                user_id: self.sender.user_id,
                nickname: self.sender.nickname.clone(),
                card: self.sender.card.clone(),
                role: self.sender.role.clone(),
            }),
            timestamp: self.time,
        }
    }
}

pub fn segments_to_proto(segments: &[Segment]) -> Vec<proto::MessageSegment> {
    segments
        .iter()
        .map(|segment| proto::MessageSegment {
            r#type: segment.kind.clone(),
            data: segment.data.clone().into_iter().collect(),
        })
        .collect()
}

pub fn segments_from_proto(segments: &[proto::MessageSegment]) -> Vec<Segment> {
    segments
        .iter()
        .map(|segment| Segment {
            kind: segment.r#type.clone(),
            data: segment.data.clone().into_iter().collect(),
        })
        .collect()
}
