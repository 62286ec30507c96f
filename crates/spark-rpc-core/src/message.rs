use bytes::Bytes;
use serde_json::Value;

/// 事件消息负载。
///
/// - `Value`：结构化消息，发布时经编解码器的事件信封编码；
/// - `Frame`：已编码好的原始帧，发布时原样转发，不再经过编解码器。
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Value(Value),
    Frame(Bytes),
}

/// 待发布的事件消息。
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    topic: String,
    content_type: String,
    payload: Payload,
}

impl Message {
    pub fn new(topic: impl Into<String>, content_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            content_type: content_type.into(),
            payload,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}
