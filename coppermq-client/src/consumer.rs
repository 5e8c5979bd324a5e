use crate::{message::MessageProperties, model::ChannelNumber};
use coppermq_codec::frame::BasicDeliverArgs;
use std::future::Future;
use std::pin::Pin;

/// What the engine should do with a delivery after the consumer callback
/// returned.
///
/// The return value only matters for consumers subscribed with
/// `no_ack = false`: `Ack` emits `Basic.Ack`, `Reject` emits `Basic.Reject`
/// with requeue, and `Nothing` leaves the message unacknowledged for the
/// caller to settle later.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsumerAck {
    Ack,
    Reject,
    Nothing,
}

/// A fully collected message passed to a consumer callback.
pub struct Delivery {
    pub channel: ChannelNumber,
    /// The `Basic.Deliver` method the content arrived with.
    pub deliver: BasicDeliverArgs,
    pub properties: MessageProperties,
    pub weight: u16,
    /// Body size announced in the content header.
    pub body_size: u64,
    /// Body frame payloads concatenated.
    pub body: Vec<u8>,
    /// The individual body frame payloads, in arrival order.
    pub chunks: Vec<Vec<u8>>,
    /// Name of the queue the subscription was made on.
    pub queue: String,
    /// The `no_ack` mode the consumer was registered with.
    pub no_ack: bool,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = String::from_utf8_lossy(&self.body[..std::cmp::min(64usize, self.body.len())]);

        f.write_fmt(format_args!(
            "Delivery {{ channel: {}, consumer_tag: {}, delivery_tag: {}, queue: {}, body: \"{}\" }}",
            &self.channel, &self.deliver.consumer_tag, &self.deliver.delivery_tag, &self.queue, body
        ))
    }
}

/// Boxed consumer callback invoked by the event loop for each delivery.
pub type ConsumerCallback =
    Box<dyn FnMut(Delivery) -> Pin<Box<dyn Future<Output = ConsumerAck> + Send>> + Send>;

/// Options of a `Basic.Consume` subscription.
#[derive(Clone, Debug)]
pub struct ConsumeOptions {
    /// Consumer tag to register with; a tag is generated when empty.
    pub consumer_tag: Option<String>,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            consumer_tag: None,
            no_ack: true,
            exclusive: false,
            no_local: false,
        }
    }
}

impl ConsumeOptions {
    pub fn consumer_tag(mut self, consumer_tag: &str) -> Self {
        self.consumer_tag = Some(consumer_tag.to_string());
        self
    }

    pub fn no_ack(mut self, mode: bool) -> Self {
        self.no_ack = mode;
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.exclusive = mode;
        self
    }

    pub fn no_local(mut self, mode: bool) -> Self {
        self.no_local = mode;
        self
    }
}
