use crate::consumer::{ConsumeOptions, ConsumerAck, Delivery};
use crate::message::{Content, PublishOptions};
use crate::model::{ChannelNumber, QueueSlot};
use crate::processor::{self, ClientRequest, ClientRequestSink, Param};
use anyhow::{anyhow, Result};
use tokio::sync::oneshot;
use coppermq_codec::frame::{AMQPFrame, ExchangeDeclareArgs, QueueDeclareFlags};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Options of a queue declaration, overlaid on the handle defaults:
/// queues are exclusive auto-delete unless told otherwise.
#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            passive: false,
        }
    }
}

impl QueueOptions {
    pub fn durable(mut self, mode: bool) -> Self {
        self.durable = mode;
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.exclusive = mode;
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.auto_delete = mode;
        self
    }

    pub fn passive(mut self, mode: bool) -> Self {
        self.passive = mode;
        self
    }

    pub(crate) fn to_flags(&self) -> QueueDeclareFlags {
        let mut flags = QueueDeclareFlags::empty();

        flags.set(QueueDeclareFlags::DURABLE, self.durable);
        flags.set(QueueDeclareFlags::EXCLUSIVE, self.exclusive);
        flags.set(QueueDeclareFlags::AUTO_DELETE, self.auto_delete);
        flags.set(QueueDeclareFlags::PASSIVE, self.passive);

        flags
    }
}

struct QueueCache {
    by_name: HashMap<String, QueueSlot>,
    next_slot: QueueSlot,
}

/// Handle of an AMQP channel.
///
/// The handle is a thin sender towards the event loop: operations invoked
/// before the channel finished opening are queued there and replayed once
/// `Channel.OpenOk` arrives.
#[derive(Clone)]
pub struct Channel {
    number: ChannelNumber,
    sink: ClientRequestSink,
    queues: Arc<Mutex<QueueCache>>,
}

impl Channel {
    pub(crate) fn new(number: ChannelNumber, sink: ClientRequestSink) -> Channel {
        Channel {
            number,
            sink,
            queues: Arc::new(Mutex::new(QueueCache {
                by_name: HashMap::new(),
                next_slot: 0,
            })),
        }
    }

    pub fn number(&self) -> ChannelNumber {
        self.number
    }

    /// Get a queue handle, declaring the queue on first use. Named queues
    /// are cached per name; `None` declares a fresh queue whose name the
    /// server assigns with `DeclareOk`.
    pub fn queue(&self, name: Option<&str>, opts: QueueOptions) -> Result<Queue> {
        let mut cache = self.queues.lock().unwrap();

        if let Some(name) = name {
            if let Some(&slot) = cache.by_name.get(name) {
                return Ok(Queue::new(self.number, slot, self.sink.clone()));
            }
        }

        let slot = cache.next_slot;
        cache.next_slot += 1;

        if let Some(name) = name {
            cache.by_name.insert(name.to_string(), slot);
        }

        processor::send(
            &self.sink,
            Param::DeclareQueue {
                channel: self.number,
                slot,
                name: name.map(str::to_string),
                opts,
            },
        )?;

        Ok(Queue::new(self.number, slot, self.sink.clone()))
    }

    /// Declare an exchange on this channel.
    pub fn exchange_declare(&self, args: ExchangeDeclareArgs) -> Result<()> {
        processor::send(&self.sink, Param::DeclareExchange(self.number, args))
    }

    /// Send raw frames on this channel through its synchronous gate.
    pub fn send_frames(&self, frames: Vec<AMQPFrame>) -> Result<()> {
        processor::send(&self.sink, Param::SendBatch(self.number, frames))
    }

    /// Stop the whole connection when the broker closes this channel.
    pub fn cascade_failure(&self, mode: bool) -> Result<()> {
        processor::send(&self.sink, Param::SetCascadeFailure(self.number, mode))
    }

    /// Hook fired with a readable reason when the broker closes the
    /// channel.
    pub fn on_close<F>(&self, hook: F) -> Result<()>
    where
        F: FnMut(String) + Send + 'static,
    {
        processor::send(&self.sink, Param::SetCloseHook(self.number, Box::new(hook)))
    }

    /// Run a hook once the channel is open, immediately when it already
    /// is. The hook gets a clone of this handle.
    pub fn do_when_created<F, Fut>(&self, hook: F) -> Result<()>
    where
        F: FnOnce(Channel) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        self.sink
            .send(ClientRequest {
                param: Param::ChannelReady(self.number),
                done: Some(tx),
            })
            .map_err(|_| anyhow!("Connection is closed"))?;

        let handle = self.clone();

        tokio::spawn(async move {
            if matches!(rx.await, Ok(Ok(()))) {
                hook(handle).await;
            }
        });

        Ok(())
    }

    /// Cancel a consumer subscription by its tag.
    pub fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        processor::send(
            &self.sink,
            Param::CancelConsumer(self.number, consumer_tag.to_string()),
        )
    }

    /// Close the channel; resolves when `Channel.CloseOk` arrives.
    pub async fn close(&self) -> Result<()> {
        processor::call(&self.sink, Param::CloseChannel(self.number)).await
    }
}

/// Handle of a queue on a channel.
///
/// Operations on a queue which is not declared yet (including one whose
/// server assigned name is still unknown) are queued on the event loop
/// and executed in order right after `Queue.DeclareOk`.
#[derive(Clone)]
pub struct Queue {
    channel: ChannelNumber,
    slot: QueueSlot,
    sink: ClientRequestSink,
}

impl Queue {
    pub(crate) fn new(channel: ChannelNumber, slot: QueueSlot, sink: ClientRequestSink) -> Queue {
        Queue { channel, slot, sink }
    }

    /// Bind this queue to an exchange. Without a routing key the queue
    /// name is used, matching the publish default.
    pub fn bind(&self, exchange: &str, routing_key: Option<&str>) -> Result<()> {
        processor::send(
            &self.sink,
            Param::BindQueue {
                channel: self.channel,
                slot: self.slot,
                exchange: exchange.to_string(),
                routing_key: routing_key.map(str::to_string),
            },
        )
    }

    /// Start consuming the queue. Every collected delivery is handed to
    /// `callback`; its return value drives the ack protocol for consumers
    /// subscribed with `no_ack = false`.
    pub fn subscribe<F, Fut>(&self, callback: F, opts: ConsumeOptions) -> Result<()>
    where
        F: FnMut(Delivery) -> Fut + Send + 'static,
        Fut: Future<Output = ConsumerAck> + Send + 'static,
    {
        let mut callback = callback;

        processor::send(
            &self.sink,
            Param::Subscribe {
                channel: self.channel,
                slot: self.slot,
                callback: Box::new(move |delivery| Box::pin(callback(delivery))),
                opts,
            },
        )
    }

    /// Publish a payload to this queue: by default straight to the
    /// default exchange with the queue name as routing key.
    pub fn publish(&self, body: impl Into<Vec<u8>>, opts: PublishOptions) -> Result<()> {
        self.publish_content(Content::new(body), opts)
    }

    /// Publish a payload with explicit message properties.
    pub fn publish_content(&self, content: Content, opts: PublishOptions) -> Result<()> {
        processor::send(
            &self.sink,
            Param::Publish {
                channel: self.channel,
                slot: self.slot,
                content,
                opts,
            },
        )
    }
}
