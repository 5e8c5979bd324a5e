use crate::model::ChannelNumber;
use coppermq_codec::frame::{
    self, AMQPFieldValue, AMQPFrame, BasicPublishArgs, ContentBodyFrame, ContentHeaderFrame,
    FieldTable, HeaderPropertyFlags,
};
use std::collections::HashMap;

/// A message body together with its properties.
#[derive(Debug, Default)]
pub struct Content {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Content {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }
}

/// Standard set of message properties
#[derive(Clone, Debug, Default)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: HashMap<String, String>,
    /// 1 - non-persistent, 2 - persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl From<ContentHeaderFrame> for MessageProperties {
    fn from(header: ContentHeaderFrame) -> Self {
        let mut headers = HashMap::new();

        if let Some(table) = header.headers {
            for (k, v) in table {
                match v {
                    AMQPFieldValue::Bool(b) => {
                        headers.insert(k, b.to_string());
                    }
                    AMQPFieldValue::LongString(s) => {
                        headers.insert(k, s);
                    }
                    AMQPFieldValue::EmptyFieldTable | AMQPFieldValue::FieldTable(_) => {}
                }
            }
        }

        Self {
            content_type: header.content_type,
            content_encoding: header.content_encoding,
            headers,
            delivery_mode: header.delivery_mode,
            priority: header.priority,
            correlation_id: header.correlation_id,
            reply_to: header.reply_to,
            expiration: header.expiration,
            message_id: header.message_id,
            timestamp: header.timestamp,
            message_type: header.message_type,
            user_id: header.user_id,
            app_id: header.app_id,
        }
    }
}

/// Options of a `Basic.Publish`, overlaid on the queue handle defaults.
#[derive(Clone, Debug)]
pub struct PublishOptions {
    pub exchange: String,
    /// Defaults to the queue name the publish was made through.
    pub routing_key: Option<String>,
    pub content_type: String,
    pub delivery_mode: u8,
    pub priority: u8,
    pub mandatory: bool,
    pub immediate: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            exchange: "".to_string(),
            routing_key: None,
            content_type: "application/octet-stream".to_string(),
            delivery_mode: 1,
            priority: 1,
            mandatory: true,
            immediate: false,
        }
    }
}

impl PublishOptions {
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_string();
        self
    }

    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = Some(routing_key.to_string());
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn delivery_mode(mut self, delivery_mode: u8) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn mandatory(mut self, mode: bool) -> Self {
        self.mandatory = mode;
        self
    }

    /// Fill in the option defaults for properties the caller left unset.
    pub(crate) fn apply_to(&self, properties: &mut MessageProperties) {
        if properties.content_type.is_none() {
            properties.content_type = Some(self.content_type.clone());
        }
        if properties.delivery_mode.is_none() {
            properties.delivery_mode = Some(self.delivery_mode);
        }
        if properties.priority.is_none() {
            properties.priority = Some(self.priority);
        }
    }
}

fn property_flags(properties: &MessageProperties) -> HeaderPropertyFlags {
    let mut flags = HeaderPropertyFlags::empty();

    flags.set(HeaderPropertyFlags::CONTENT_TYPE, properties.content_type.is_some());
    flags.set(HeaderPropertyFlags::CONTENT_ENCODING, properties.content_encoding.is_some());
    flags.set(HeaderPropertyFlags::HEADERS, !properties.headers.is_empty());
    flags.set(HeaderPropertyFlags::DELIVERY_MODE, properties.delivery_mode.is_some());
    flags.set(HeaderPropertyFlags::PRIORITY, properties.priority.is_some());
    flags.set(HeaderPropertyFlags::CORRELATION_ID, properties.correlation_id.is_some());
    flags.set(HeaderPropertyFlags::REPLY_TO, properties.reply_to.is_some());
    flags.set(HeaderPropertyFlags::EXPIRATION, properties.expiration.is_some());
    flags.set(HeaderPropertyFlags::MESSAGE_ID, properties.message_id.is_some());
    flags.set(HeaderPropertyFlags::TIMESTAMP, properties.timestamp.is_some());
    flags.set(HeaderPropertyFlags::MESSAGE_TYPE, properties.message_type.is_some());
    flags.set(HeaderPropertyFlags::USER_ID, properties.user_id.is_some());
    flags.set(HeaderPropertyFlags::APP_ID, properties.app_id.is_some());

    flags
}

pub(crate) fn to_content_header(
    channel: ChannelNumber,
    body_size: u64,
    properties: MessageProperties,
) -> ContentHeaderFrame {
    let prop_flags = property_flags(&properties);

    let headers = if properties.headers.is_empty() {
        None
    } else {
        let mut table = FieldTable::new();

        for (k, v) in properties.headers {
            table.insert(k, AMQPFieldValue::LongString(v));
        }

        Some(table)
    };

    ContentHeaderFrame {
        channel,
        class_id: (frame::BASIC_PUBLISH >> 16) as u16,
        weight: 0,
        body_size,
        prop_flags,
        content_type: properties.content_type,
        content_encoding: properties.content_encoding,
        headers,
        delivery_mode: properties.delivery_mode,
        priority: properties.priority,
        correlation_id: properties.correlation_id,
        reply_to: properties.reply_to,
        expiration: properties.expiration,
        message_id: properties.message_id,
        timestamp: properties.timestamp,
        message_type: properties.message_type,
        user_id: properties.user_id,
        app_id: properties.app_id,
        cluster_id: None,
    }
}

/// Expand a publish into the method, header and body frames.
///
/// The body is split into `ceil(len / frame_max)` chunks so no body frame
/// exceeds the negotiated frame size. Before tune negotiation `frame_max`
/// is 0 and the whole payload travels in a single body frame.
pub fn compose_publish(
    channel: ChannelNumber,
    args: BasicPublishArgs,
    content: Content,
    frame_max: u32,
) -> Vec<AMQPFrame> {
    let Content { body, properties } = content;
    let chunk_size = if frame_max == 0 { body.len() } else { frame_max as usize };
    let chunk_count = if chunk_size == 0 { 0 } else { (body.len() + chunk_size - 1) / chunk_size };

    let mut frames = Vec::with_capacity(2 + chunk_count);
    frames.push(args.frame(channel));
    frames.push(to_content_header(channel, body.len() as u64, properties).frame());

    if body.is_empty() {
        return frames;
    }

    for chunk in body.chunks(chunk_size) {
        frames.push(
            ContentBodyFrame {
                channel,
                body: chunk.to_vec(),
            }
            .frame(),
        );
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_sizes(frames: &[AMQPFrame]) -> Vec<usize> {
        frames
            .iter()
            .filter_map(|f| match f {
                AMQPFrame::ContentBody(cb) => Some(cb.body.len()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn publish_is_chunked_by_frame_max() {
        let content = Content::new(vec![7u8; 250]);
        let frames = compose_publish(1, BasicPublishArgs::new(""), content, 100);

        assert!(matches!(frames[0], AMQPFrame::Method(1, frame::BASIC_PUBLISH, _)));
        match &frames[1] {
            AMQPFrame::ContentHeader(h) => assert_eq!(250, h.body_size),
            other => panic!("Expected content header, got {:?}", other),
        }
        assert_eq!(vec![100, 100, 50], body_sizes(&frames));
    }

    #[test]
    fn chunks_concatenate_to_the_payload() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let frames = compose_publish(1, BasicPublishArgs::new(""), Content::new(payload.clone()), 33);

        let mut rebuilt = Vec::new();

        for f in &frames {
            if let AMQPFrame::ContentBody(cb) = f {
                assert!(cb.body.len() <= 33);
                rebuilt.extend_from_slice(&cb.body);
            }
        }

        assert_eq!((1000 + 32) / 33, body_sizes(&frames).len());
        assert_eq!(payload, rebuilt);
    }

    #[test]
    fn zero_frame_max_keeps_the_body_whole() {
        let frames = compose_publish(1, BasicPublishArgs::new(""), Content::new(vec![1u8; 5000]), 0);

        assert_eq!(vec![5000], body_sizes(&frames));
    }

    #[test]
    fn empty_body_has_no_body_frames() {
        let frames = compose_publish(1, BasicPublishArgs::new(""), Content::new(vec![]), 100);

        assert_eq!(2, frames.len());
        match &frames[1] {
            AMQPFrame::ContentHeader(h) => assert_eq!(0, h.body_size),
            other => panic!("Expected content header, got {:?}", other),
        }
    }

    #[test]
    fn publish_defaults_fill_missing_properties() {
        let opts = PublishOptions::default();
        let mut properties = MessageProperties::default();

        opts.apply_to(&mut properties);

        assert_eq!(Some("application/octet-stream".to_string()), properties.content_type);
        assert_eq!(Some(1), properties.delivery_mode);
        assert_eq!(Some(1), properties.priority);

        let mut custom = MessageProperties {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };

        opts.apply_to(&mut custom);

        assert_eq!(Some("text/plain".to_string()), custom.content_type);
    }
}
