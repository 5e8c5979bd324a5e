//! The per-connection protocol state machine. It owns every channel's
//! bookkeeping (consumer table, queue table, content collection, sync
//! gate) and turns requests from the public handles plus inbound frames
//! into outbound frames.
//!
//! Everything here runs on the event loop task in `processor`, so no
//! state is shared or locked.

use crate::callbacks::{self, ChannelCloseHook};
use crate::client_error;
use crate::config::DebugFlags;
use crate::connection::Connection;
use crate::consumer::{ConsumeOptions, ConsumerAck, ConsumerCallback, Delivery};
use crate::gate::{OnReply, PendingConsumer, PendingSync, SyncBatch, SyncGate};
use crate::message::{compose_publish, MessageProperties};
use crate::model::{ChannelNumber, ClassMethod, QueueSlot};
use crate::processor::{ClientRequest, LoopExit, Param, ReplySink};
use anyhow::{anyhow, Result};
use coppermq_codec::codec::Frame;
use coppermq_codec::frame::{
    self, AMQPFrame, BasicCancelArgs, BasicCancelOkArgs, BasicConsumeArgs, BasicConsumeOkArgs,
    BasicDeliverArgs, BasicPublishArgs, BasicRejectArgs, BasicReturnArgs, ChannelCloseArgs,
    ConnectionCloseArgs, ConnectionStartArgs, ConnectionStartOkArgs, ConnectionTuneArgs,
    ContentBodyFrame, ContentHeaderFrame, MethodFrameArgs, QueueBindArgs, QueueDeclareArgs,
    QueueDeclareOkArgs,
};
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

#[derive(Debug)]
enum Phase {
    Uninitialized,
    Connected,
    Authenticated,
    Open,
}

/// A content being delivered by content frames, building step by step.
/// While it is active no other method frame may arrive on the channel.
struct ContentAssembly {
    method: ContentMethod,
    header: Option<ContentHeaderFrame>,
    body_size: u64,
    received: u64,
    chunks: Vec<Vec<u8>>,
}

enum ContentMethod {
    Deliver(BasicDeliverArgs),
    Return(BasicReturnArgs),
}

struct ConsumerEntry {
    queue: String,
    callback: ConsumerCallback,
    opts: ConsumeOptions,
}

struct QueueState {
    name: Option<String>,
    is_created: bool,
    deferred: VecDeque<ClientRequest>,
}

struct ChannelState {
    is_created: bool,
    cascade_failure: bool,
    close_hook: Option<ChannelCloseHook>,
    gate: SyncGate,
    /// Requests waiting for `Channel.OpenOk`, replayed in order.
    deferred: VecDeque<ClientRequest>,
    /// Active consumers by consumer tag.
    consumers: HashMap<String, ConsumerEntry>,
    queues: HashMap<QueueSlot, QueueState>,
    queue_names: HashMap<String, QueueSlot>,
    assembly: Option<ContentAssembly>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            is_created: false,
            cascade_failure: false,
            close_hook: None,
            gate: SyncGate::default(),
            deferred: VecDeque::new(),
            consumers: HashMap::new(),
            queues: HashMap::new(),
            queue_names: HashMap::new(),
            assembly: None,
        }
    }
}

pub(crate) struct ClientState {
    phase: Phase,
    conn: Connection,
    reconnected: bool,
    /// Negotiated in `Connection.Tune`, used for publish chunking.
    frame_max: u32,
    outgoing: mpsc::Sender<Frame>,
    /// Gate of channel 0; connection methods are synchronous too.
    gate0: SyncGate,
    /// Requests waiting for `Connection.OpenOk`, replayed in order.
    deferred: VecDeque<ClientRequest>,
    channels: HashMap<ChannelNumber, ChannelState>,
    exit: Option<LoopExit>,
}

impl ClientState {
    pub(crate) fn new(outgoing: mpsc::Sender<Frame>, conn: Connection, reconnected: bool) -> Self {
        Self {
            phase: Phase::Uninitialized,
            conn,
            reconnected,
            frame_max: 0,
            outgoing,
            gate0: SyncGate::default(),
            deferred: VecDeque::new(),
            channels: HashMap::new(),
            exit: None,
        }
    }

    pub(crate) fn exit(&self) -> Option<LoopExit> {
        self.exit
    }

    /// Kick off the handshake with the protocol preface.
    pub(crate) async fn start(&mut self) -> Result<()> {
        self.send_out(Frame::Frame(AMQPFrame::Header)).await
    }

    async fn send_out(&mut self, frame: Frame) -> Result<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| anyhow!("Writer task is gone"))
    }

    async fn send_frames(&mut self, mut frames: Vec<AMQPFrame>) -> Result<()> {
        if frames.len() == 1 {
            self.send_out(Frame::Frame(frames.remove(0))).await
        } else {
            self.send_out(Frame::Frames(frames)).await
        }
    }

    fn logic_trace(&self) -> bool {
        self.conn.debug_flags().contains(DebugFlags::LOGIC)
    }

    /////////////////////////////////////////////////////////////////////////
    // Sync gate plumbing

    fn gate_mut(&mut self, channel: ChannelNumber) -> Option<&mut SyncGate> {
        if channel == 0 {
            Some(&mut self.gate0)
        } else {
            self.channels.get_mut(&channel).map(|ch| &mut ch.gate)
        }
    }

    /// Push a batch through the channel's gate; frames go out right away
    /// unless a synchronous exchange is outstanding.
    async fn admit(&mut self, channel: ChannelNumber, batch: SyncBatch) -> Result<()> {
        let admitted = match self.gate_mut(channel) {
            Some(gate) => gate.admit(batch),
            None => {
                error!("No channel {} to send frames on", channel);
                return Ok(());
            }
        };

        match admitted {
            Some(admitted) => {
                self.send_frames(admitted.frames).await?;

                if let Some(done) = admitted.done {
                    let _ = done.send(Ok(()));
                }
            }
            None => {
                if self.logic_trace() {
                    trace!("Gate of channel {} is busy, batch deferred", channel);
                }
            }
        }

        Ok(())
    }

    /// Re-admit deferred batches after a reply settled the gate, FIFO until
    /// the gate blocks again.
    async fn release(&mut self, channel: ChannelNumber) -> Result<()> {
        loop {
            let batch = match self.gate_mut(channel) {
                Some(gate) => gate.release_next(),
                None => None,
            };

            match batch {
                Some(batch) => self.admit(channel, batch).await?,
                None => break,
            }
        }

        Ok(())
    }

    fn settle(&mut self, channel: ChannelNumber, response: ClassMethod) -> Option<PendingSync> {
        let pending = self.gate_mut(channel).and_then(|gate| gate.settle(response));

        if pending.is_none() {
            warn!("Reply {:08X} on channel {} matches no outstanding request", response, channel);
        }

        pending
    }

    /////////////////////////////////////////////////////////////////////////
    // Requests from the client API

    pub(crate) async fn handle_request(&mut self, request: ClientRequest) -> Result<()> {
        // Deferral happens in three layers, all replayed in order: the
        // whole connection waits for `Connection.OpenOk`, a channel waits
        // for its `Channel.OpenOk`, a queue waits for its `DeclareOk`.
        let logic = self.logic_trace();

        if !matches!(self.phase, Phase::Open)
            && !matches!(request.param, Param::Stop | Param::Shutdown)
        {
            if logic {
                trace!("Connection not started yet, deferring {:?}", request);
            }

            self.deferred.push_back(request);

            return Ok(());
        }

        if let Some(channel) = request.param.deferrable_channel() {
            if channel != 0 {
                match self.channels.get_mut(&channel) {
                    None => {
                        error!("Request for unknown channel {}: {:?}", channel, request);

                        if let Some(done) = request.done {
                            let _ = done.send(client_error!(Some(channel), 504, "Channel is not open", 0));
                        }

                        return Ok(());
                    }
                    Some(ch) if !ch.is_created => {
                        if logic {
                            trace!("Channel {} not open yet, deferring {:?}", channel, request);
                        }

                        ch.deferred.push_back(request);

                        return Ok(());
                    }
                    Some(_) => (),
                }
            }
        }

        if let Some((channel, slot)) = request.param.queue_slot() {
            let created = self
                .channels
                .get(&channel)
                .and_then(|ch| ch.queues.get(&slot))
                .map(|q| q.is_created)
                .unwrap_or(false);

            if !created {
                match self.channels.get_mut(&channel).and_then(|ch| ch.queues.get_mut(&slot)) {
                    Some(queue) => {
                        if logic {
                            trace!("Queue slot {} on channel {} not declared yet, deferring {:?}", slot, channel, request);
                        }

                        queue.deferred.push_back(request);
                    }
                    None => {
                        error!("Request for unknown queue slot {} on channel {}", slot, channel);

                        if let Some(done) = request.done {
                            let _ = done.send(client_error!(Some(channel), 404, "Queue is not declared", 0));
                        }
                    }
                }

                return Ok(());
            }
        }

        self.execute(request).await
    }

    async fn execute(&mut self, request: ClientRequest) -> Result<()> {
        let ClientRequest { param, done } = request;

        match param {
            Param::Stop => self.stop(done).await,
            Param::Shutdown => {
                info!("Immediate shutdown");
                self.exit = Some(LoopExit::Stopped);

                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }

                Ok(())
            }
            Param::OpenChannel(channel) => self.open_channel(channel, done).await,
            Param::SetCascadeFailure(channel, mode) => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.cascade_failure = mode;
                }

                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }

                Ok(())
            }
            Param::SetCloseHook(channel, hook) => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.close_hook = Some(hook);
                }

                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }

                Ok(())
            }
            Param::SendBatch(channel, frames) => {
                self.admit(channel, SyncBatch::new(frames).done(done)).await
            }
            Param::DeclareExchange(channel, args) => {
                self.admit(
                    channel,
                    SyncBatch::new(vec![args.frame(channel)])
                        .on_reply(OnReply::ExchangeDeclared)
                        .done(done),
                )
                .await
            }
            Param::DeclareQueue { channel, slot, name, opts } => {
                let args = QueueDeclareArgs {
                    name: name.clone().unwrap_or_default(),
                    flags: opts.to_flags(),
                    args: None,
                };

                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.queues.entry(slot).or_insert_with(|| QueueState {
                        name,
                        is_created: false,
                        deferred: VecDeque::new(),
                    });
                }

                self.admit(
                    channel,
                    SyncBatch::new(vec![args.frame(channel)])
                        .on_reply(OnReply::QueueDeclared { slot })
                        .done(done),
                )
                .await
            }
            Param::BindQueue { channel, slot, exchange, routing_key } => {
                let queue = self.queue_name(channel, slot);
                let routing_key = routing_key.unwrap_or_else(|| queue.clone());
                let args = QueueBindArgs::new(&queue, &exchange).routing_key(&routing_key);

                self.admit(
                    channel,
                    SyncBatch::new(vec![args.frame(channel)])
                        .on_reply(OnReply::QueueBound { slot })
                        .done(done),
                )
                .await
            }
            Param::Subscribe { channel, slot, callback, opts } => {
                let queue = self.queue_name(channel, slot);
                let consumer_tag = opts
                    .consumer_tag
                    .clone()
                    .unwrap_or_else(|| format!("coppermq-{}", rand::random::<u64>()));
                let args = BasicConsumeArgs::default()
                    .queue(&queue)
                    .consumer_tag(&consumer_tag)
                    .no_ack(opts.no_ack)
                    .exclusive(opts.exclusive)
                    .no_local(opts.no_local);

                self.admit(
                    channel,
                    SyncBatch::new(vec![args.frame(channel)])
                        .on_reply(OnReply::ConsumeStarted {
                            slot,
                            consumer: PendingConsumer { callback, opts },
                        })
                        .done(done),
                )
                .await
            }
            Param::Publish { channel, slot, mut content, opts } => {
                let queue = self.queue_name(channel, slot);
                let routing_key = opts.routing_key.clone().unwrap_or(queue);

                opts.apply_to(&mut content.properties);

                let args = BasicPublishArgs::new(&opts.exchange)
                    .routing_key(&routing_key)
                    .mandatory(opts.mandatory)
                    .immediate(opts.immediate);
                let frames = compose_publish(channel, args, content, self.frame_max);

                self.admit(channel, SyncBatch::new(frames).done(done)).await
            }
            Param::ChannelReady(_) => {
                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }

                Ok(())
            }
            Param::CancelConsumer(channel, consumer_tag) => {
                self.admit(
                    channel,
                    SyncBatch::new(vec![BasicCancelArgs::new(&consumer_tag).frame(channel)])
                        .on_reply(OnReply::ConsumerCancelled)
                        .done(done),
                )
                .await
            }
            Param::CloseChannel(channel) => {
                self.admit(
                    channel,
                    SyncBatch::new(vec![ChannelCloseArgs::new(200, "Normal close").frame(channel)])
                        .on_reply(OnReply::ChannelClosed)
                        .done(done),
                )
                .await
            }
        }
    }

    async fn open_channel(&mut self, channel: ChannelNumber, done: Option<ReplySink>) -> Result<()> {
        if self.channels.contains_key(&channel) {
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }

            return Ok(());
        }

        self.channels.insert(channel, ChannelState::new());

        self.admit(
            channel,
            SyncBatch::new(vec![frame::channel_open(channel)])
                .on_reply(OnReply::ChannelOpened)
                .done(done),
        )
        .await
    }

    async fn stop(&mut self, done: Option<ReplySink>) -> Result<()> {
        self.conn.status().set_stopping(true);

        self.admit(
            0,
            SyncBatch::new(vec![ConnectionCloseArgs::new(200, "Normal close").frame()])
                .on_reply(OnReply::ConnectionClosed)
                .done(done),
        )
        .await
    }

    fn queue_name(&self, channel: ChannelNumber, slot: QueueSlot) -> String {
        self.channels
            .get(&channel)
            .and_then(|ch| ch.queues.get(&slot))
            .and_then(|q| q.name.clone())
            .unwrap_or_default()
    }

    /////////////////////////////////////////////////////////////////////////
    // Inbound frames

    pub(crate) async fn handle_frame(&mut self, frame: AMQPFrame) -> Result<()> {
        match frame {
            AMQPFrame::Header => Ok(()),
            AMQPFrame::Heartbeat(_) => Ok(()),
            AMQPFrame::Method(0, _, args) => self.handle_connection_method(args).await,
            AMQPFrame::Method(channel, cm, args) => self.handle_channel_method(channel, cm, args).await,
            AMQPFrame::ContentHeader(header) => self.content_header(header).await,
            AMQPFrame::ContentBody(body) => self.content_body(body).await,
        }
    }

    async fn handle_connection_method(&mut self, args: MethodFrameArgs) -> Result<()> {
        match args {
            MethodFrameArgs::ConnectionStart(args) => self.connection_start(args).await,
            MethodFrameArgs::ConnectionTune(args) => self.connection_tune(args).await,
            MethodFrameArgs::ConnectionOpenOk => self.connection_open_ok().await,
            MethodFrameArgs::ConnectionClose(args) => self.handle_connection_close(args).await,
            MethodFrameArgs::ConnectionCloseOk => self.connection_close_ok().await,
            other => {
                error!("Unexpected method on channel 0 in phase {:?}: {:?}", self.phase, other);
                Ok(())
            }
        }
    }

    async fn handle_channel_method(
        &mut self,
        channel: ChannelNumber,
        cm: ClassMethod,
        args: MethodFrameArgs,
    ) -> Result<()> {
        match self.channels.get(&channel) {
            None => {
                error!("Frame for unknown channel {}: {:08X}", channel, cm);
                return Ok(());
            }
            // between a deliver/return and its last body byte only content
            // frames are legal on the channel
            Some(ch) if ch.assembly.is_some() => {
                error!("Method {:08X} while collecting content on channel {}", cm, channel);
                return Ok(());
            }
            Some(_) => (),
        }

        match args {
            MethodFrameArgs::ChannelOpenOk => self.channel_open_ok(channel).await,
            MethodFrameArgs::ChannelClose(args) => self.handle_channel_close(channel, args).await,
            MethodFrameArgs::ChannelCloseOk => self.channel_close_ok(channel).await,
            MethodFrameArgs::ExchangeDeclareOk => self.settled_simple(channel, frame::EXCHANGE_DECLARE_OK).await,
            MethodFrameArgs::QueueDeclareOk(args) => self.queue_declare_ok(channel, args).await,
            MethodFrameArgs::QueueBindOk => self.settled_simple(channel, frame::QUEUE_BIND_OK).await,
            MethodFrameArgs::BasicConsumeOk(args) => self.basic_consume_ok(channel, args).await,
            MethodFrameArgs::BasicCancelOk(args) => self.basic_cancel_ok(channel, args).await,
            MethodFrameArgs::BasicDeliver(args) => self.basic_deliver(channel, args).await,
            MethodFrameArgs::BasicReturn(args) => self.basic_return(channel, args).await,
            other => {
                error!("Unexpected method on channel {}: {:?}", channel, other);
                Ok(())
            }
        }
    }

    /////////////////////////////////////////////////////////////////////////
    // Handshake, channel 0

    async fn connection_start(&mut self, args: ConnectionStartArgs) -> Result<()> {
        info!("Server supported mechanisms: {}", args.mechanisms);

        self.phase = Phase::Connected;

        let (username, password) = self.conn.credentials();
        let start_ok = ConnectionStartOkArgs::amqplain(&username, &password);

        self.send_out(Frame::Frame(start_ok.frame())).await
    }

    async fn connection_tune(&mut self, args: ConnectionTuneArgs) -> Result<()> {
        self.phase = Phase::Authenticated;
        self.frame_max = args.frame_max;

        self.send_out(Frame::Frame(frame::connection_tune_ok(args.frame_max)))
            .await?;

        let open = frame::ConnectionOpenArgs::default()
            .virtual_host(&self.conn.virtual_host())
            .insist(true);

        self.admit(
            0,
            SyncBatch::new(vec![open.frame()]).on_reply(OnReply::ConnectionOpened),
        )
        .await
    }

    async fn connection_open_ok(&mut self) -> Result<()> {
        let pending = match self.settle(0, frame::CONNECTION_OPEN_OK) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        self.phase = Phase::Open;
        self.conn.status().set_started(true);

        info!("Connection is open on virtual host {}", self.conn.virtual_host());

        let deferred = std::mem::take(&mut self.deferred);

        for request in deferred {
            self.handle_request(request).await?;
        }

        callbacks::fire(self.conn.hooks().startup_hooks(), &self.conn).await;

        if self.reconnected {
            callbacks::fire(self.conn.hooks().reconnected_hooks(), &self.conn).await;
        }

        if let Some(done) = pending.done {
            let _ = done.send(Ok(()));
        }

        self.release(0).await
    }

    async fn handle_connection_close(&mut self, args: ConnectionCloseArgs) -> Result<()> {
        error!(
            "Connection closed by server: code={} text={} class_id={} method_id={}",
            args.code, args.text, args.class_id, args.method_id
        );

        self.send_out(Frame::Frame(frame::connection_close_ok())).await?;
        self.exit = Some(LoopExit::Disconnected);

        Ok(())
    }

    async fn connection_close_ok(&mut self) -> Result<()> {
        let pending = self.gate0.settle(frame::CONNECTION_CLOSE_OK);

        self.exit = Some(LoopExit::Stopped);

        if let Some(pending) = pending {
            if let Some(done) = pending.done {
                let _ = done.send(Ok(()));
            }
        }

        Ok(())
    }

    /////////////////////////////////////////////////////////////////////////
    // Channel methods

    async fn channel_open_ok(&mut self, channel: ChannelNumber) -> Result<()> {
        let pending = match self.settle(channel, frame::CHANNEL_OPEN_OK) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let mut deferred = VecDeque::new();

        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.is_created = true;
            deferred = std::mem::take(&mut ch.deferred);
        }

        debug!("Channel {} is open", channel);

        if let Some(done) = pending.done {
            let _ = done.send(Ok(()));
        }

        for request in deferred {
            self.handle_request(request).await?;
        }

        self.release(channel).await
    }

    async fn handle_channel_close(&mut self, channel: ChannelNumber, args: ChannelCloseArgs) -> Result<()> {
        let reason = format!(
            "Channel {} closed by server: code={} text={} class_id={} method_id={}",
            channel, args.code, args.text, args.class_id, args.method_id
        );

        error!("{}", reason);

        let cascade = match self.channels.remove(&channel) {
            Some(mut ch) => {
                if let Some(hook) = ch.close_hook.as_mut() {
                    hook(reason);
                }

                ch.cascade_failure
            }
            None => false,
        };

        self.conn.release_channel(channel);

        if cascade {
            self.stop(None).await
        } else {
            self.send_out(Frame::Frame(frame::channel_close_ok(channel))).await
        }
    }

    async fn channel_close_ok(&mut self, channel: ChannelNumber) -> Result<()> {
        let pending = self
            .channels
            .get_mut(&channel)
            .and_then(|ch| ch.gate.settle(frame::CHANNEL_CLOSE_OK));

        self.channels.remove(&channel);
        self.conn.release_channel(channel);

        debug!("Channel {} is closed", channel);

        if let Some(pending) = pending {
            if let Some(done) = pending.done {
                let _ = done.send(Ok(()));
            }
        }

        Ok(())
    }

    /// Settle a reply which needs no state change beyond unblocking the gate.
    async fn settled_simple(&mut self, channel: ChannelNumber, response: ClassMethod) -> Result<()> {
        if let Some(pending) = self.settle(channel, response) {
            if let Some(done) = pending.done {
                let _ = done.send(Ok(()));
            }

            self.release(channel).await?;
        }

        Ok(())
    }

    async fn queue_declare_ok(&mut self, channel: ChannelNumber, args: QueueDeclareOkArgs) -> Result<()> {
        let pending = match self.settle(channel, frame::QUEUE_DECLARE_OK) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let mut deferred = VecDeque::new();

        if let OnReply::QueueDeclared { slot } = pending.on_reply {
            if let Some(ch) = self.channels.get_mut(&channel) {
                if let Some(queue) = ch.queues.get_mut(&slot) {
                    // a queue declared without a name adopts the server
                    // assigned one
                    queue.name = Some(args.name.clone());
                    queue.is_created = true;
                    deferred = std::mem::take(&mut queue.deferred);
                }

                ch.queue_names.insert(args.name.clone(), slot);
            }

            debug!("Queue {} is declared on channel {}", args.name, channel);
        }

        if let Some(done) = pending.done {
            let _ = done.send(Ok(()));
        }

        for request in deferred {
            self.handle_request(request).await?;
        }

        self.release(channel).await
    }

    async fn basic_consume_ok(&mut self, channel: ChannelNumber, args: BasicConsumeOkArgs) -> Result<()> {
        let pending = match self.settle(channel, frame::BASIC_CONSUME_OK) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        if let OnReply::ConsumeStarted { slot, consumer } = pending.on_reply {
            let queue = self.queue_name(channel, slot);

            debug!("Consumer {} registered on queue {}", args.consumer_tag, queue);

            if let Some(ch) = self.channels.get_mut(&channel) {
                ch.consumers.insert(
                    args.consumer_tag,
                    ConsumerEntry {
                        queue,
                        callback: consumer.callback,
                        opts: consumer.opts,
                    },
                );
            }
        }

        if let Some(done) = pending.done {
            let _ = done.send(Ok(()));
        }

        self.release(channel).await
    }

    async fn basic_cancel_ok(&mut self, channel: ChannelNumber, args: BasicCancelOkArgs) -> Result<()> {
        let pending = match self.settle(channel, frame::BASIC_CANCEL_OK) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        if let Some(ch) = self.channels.get_mut(&channel) {
            if ch.consumers.remove(&args.consumer_tag).is_none() {
                warn!("Cancel-ok for unknown consumer {} on channel {}", args.consumer_tag, channel);
            }
        }

        if let Some(done) = pending.done {
            let _ = done.send(Ok(()));
        }

        self.release(channel).await
    }

    /////////////////////////////////////////////////////////////////////////
    // Content collection and consumer dispatch

    async fn basic_deliver(&mut self, channel: ChannelNumber, args: BasicDeliverArgs) -> Result<()> {
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.assembly = Some(ContentAssembly {
                method: ContentMethod::Deliver(args),
                header: None,
                body_size: 0,
                received: 0,
                chunks: vec![],
            });
        }

        Ok(())
    }

    async fn basic_return(&mut self, channel: ChannelNumber, args: BasicReturnArgs) -> Result<()> {
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.assembly = Some(ContentAssembly {
                method: ContentMethod::Return(args),
                header: None,
                body_size: 0,
                received: 0,
                chunks: vec![],
            });
        }

        Ok(())
    }

    async fn content_header(&mut self, header: ContentHeaderFrame) -> Result<()> {
        let channel = header.channel;

        let complete = match self.channels.get_mut(&channel) {
            None => {
                error!("Content header for unknown channel {}", channel);
                return Ok(());
            }
            Some(ch) => match ch.assembly.as_mut() {
                None => {
                    error!("Content header without a content method on channel {}", channel);
                    return Ok(());
                }
                Some(assembly) if assembly.header.is_some() => {
                    error!("Second content header on channel {}", channel);
                    return Ok(());
                }
                Some(assembly) => {
                    assembly.body_size = header.body_size;
                    assembly.header = Some(header);

                    // a zero sized body has no body frames at all
                    assembly.body_size == 0
                }
            },
        };

        if complete {
            self.complete_assembly(channel).await?;
        }

        Ok(())
    }

    async fn content_body(&mut self, body: ContentBodyFrame) -> Result<()> {
        let channel = body.channel;

        let complete = match self.channels.get_mut(&channel) {
            None => {
                error!("Content body for unknown channel {}", channel);
                return Ok(());
            }
            Some(ch) => match ch.assembly.as_mut() {
                None => {
                    error!("Content body without an active delivery on channel {}", channel);
                    return Ok(());
                }
                Some(assembly) if assembly.header.is_none() => {
                    error!("Content body before the content header on channel {}", channel);
                    return Ok(());
                }
                Some(assembly) => {
                    assembly.received += body.body.len() as u64;
                    assembly.chunks.push(body.body);

                    assembly.received >= assembly.body_size
                }
            },
        };

        if complete {
            self.complete_assembly(channel).await?;
        }

        Ok(())
    }

    async fn complete_assembly(&mut self, channel: ChannelNumber) -> Result<()> {
        let assembly = match self.channels.get_mut(&channel).and_then(|ch| ch.assembly.take()) {
            Some(assembly) => assembly,
            None => return Ok(()),
        };

        self.dispatch_content(channel, assembly).await
    }

    async fn dispatch_content(&mut self, channel: ChannelNumber, assembly: ContentAssembly) -> Result<()> {
        let ContentAssembly {
            method,
            header,
            body_size,
            chunks,
            ..
        } = assembly;

        let header = match header {
            Some(header) => header,
            None => return Ok(()),
        };

        match method {
            ContentMethod::Deliver(deliver) => {
                let delivery_tag = deliver.delivery_tag;

                let (ack, no_ack) = {
                    let ch = match self.channels.get_mut(&channel) {
                        Some(ch) => ch,
                        None => return Ok(()),
                    };

                    let entry = match ch.consumers.get_mut(&deliver.consumer_tag) {
                        Some(entry) => entry,
                        None => {
                            error!(
                                "No consumer registered for tag {} on channel {}, message dropped",
                                deliver.consumer_tag, channel
                            );
                            return Ok(());
                        }
                    };

                    let mut body = Vec::with_capacity(body_size as usize);

                    for chunk in &chunks {
                        body.extend_from_slice(chunk);
                    }

                    let weight = header.weight;
                    let delivery = Delivery {
                        channel,
                        deliver,
                        properties: MessageProperties::from(header),
                        weight,
                        body_size,
                        body,
                        chunks,
                        queue: entry.queue.clone(),
                        no_ack: entry.opts.no_ack,
                    };

                    ((entry.callback)(delivery).await, entry.opts.no_ack)
                };

                if !no_ack {
                    match ack {
                        ConsumerAck::Ack => {
                            self.send_out(Frame::Frame(
                                frame::BasicAckArgs::default()
                                    .delivery_tag(delivery_tag)
                                    .frame(channel),
                            ))
                            .await?;
                        }
                        ConsumerAck::Reject => {
                            self.send_out(Frame::Frame(
                                BasicRejectArgs::new(delivery_tag, true).frame(channel),
                            ))
                            .await?;
                        }
                        ConsumerAck::Nothing => (),
                    }
                }

                Ok(())
            }
            ContentMethod::Return(ret) => {
                // no user facing hook yet, the payload is dropped
                error!(
                    "Returned message dropped on channel {}: code={} text={} exchange={} routing_key={}",
                    channel, ret.reply_code, ret.reply_text, ret.exchange_name, ret.routing_key
                );

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::QueueOptions;
    use crate::config::ConnectionConfig;
    use crate::message::{Content, PublishOptions};
    use coppermq_codec::frame::{BasicConsumeFlags, QueueDeclareFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_state() -> (ClientState, mpsc::Receiver<Frame>, Connection) {
        let conn = Connection::create(ConnectionConfig::new("localhost")).unwrap();
        let (tx, rx) = mpsc::channel(64);

        (ClientState::new(tx, conn.clone(), false), rx, conn)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<AMQPFrame> {
        let mut frames = vec![];

        while let Ok(frame) = rx.try_recv() {
            match frame {
                Frame::Frame(f) => frames.push(f),
                Frame::Frames(fs) => frames.extend(fs),
            }
        }

        frames
    }

    fn request(param: Param) -> ClientRequest {
        ClientRequest { param, done: None }
    }

    async fn handshake(cs: &mut ClientState) {
        cs.connection_start(ConnectionStartArgs {
            version_major: 0,
            version_minor: 9,
            properties: None,
            mechanisms: "PLAIN AMQPLAIN".into(),
            locales: "en_US".into(),
        })
        .await
        .unwrap();

        cs.connection_tune(ConnectionTuneArgs {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
        })
        .await
        .unwrap();

        cs.connection_open_ok().await.unwrap();
    }

    async fn open_channel_with_queue(cs: &mut ClientState, rx: &mut mpsc::Receiver<Frame>) {
        cs.handle_request(request(Param::OpenChannel(1))).await.unwrap();
        cs.handle_frame(AMQPFrame::Method(1, frame::CHANNEL_OPEN_OK, MethodFrameArgs::ChannelOpenOk))
            .await
            .unwrap();
        cs.handle_request(request(Param::DeclareQueue {
            channel: 1,
            slot: 0,
            name: Some("q".into()),
            opts: QueueOptions::default(),
        }))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::QUEUE_DECLARE_OK,
            MethodFrameArgs::QueueDeclareOk(QueueDeclareOkArgs {
                name: "q".into(),
                ..Default::default()
            }),
        ))
        .await
        .unwrap();

        drain(rx);
    }

    async fn subscribe(
        cs: &mut ClientState,
        rx: &mut mpsc::Receiver<Frame>,
        callback: ConsumerCallback,
        opts: ConsumeOptions,
    ) -> String {
        cs.handle_request(request(Param::Subscribe {
            channel: 1,
            slot: 0,
            callback,
            opts,
        }))
        .await
        .unwrap();

        let frames = drain(rx);
        let tag = match &frames[0] {
            AMQPFrame::Method(1, _, MethodFrameArgs::BasicConsume(args)) => args.consumer_tag.clone(),
            other => panic!("Expected Basic.Consume, got {:?}", other),
        };

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::BASIC_CONSUME_OK,
            MethodFrameArgs::BasicConsumeOk(BasicConsumeOkArgs {
                consumer_tag: tag.clone(),
            }),
        ))
        .await
        .unwrap();

        tag
    }

    #[tokio::test]
    async fn handshake_emits_preface_start_ok_tune_ok_open() {
        let (mut cs, mut rx, conn) = test_state();

        cs.start().await.unwrap();
        cs.connection_start(ConnectionStartArgs {
            version_major: 0,
            version_minor: 9,
            properties: None,
            mechanisms: "PLAIN AMQPLAIN".into(),
            locales: "en_US".into(),
        })
        .await
        .unwrap();
        cs.connection_tune(ConnectionTuneArgs {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
        })
        .await
        .unwrap();

        let frames = drain(&mut rx);

        assert!(matches!(frames[0], AMQPFrame::Header));
        match &frames[1] {
            AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionStartOk(args)) => {
                assert_eq!("AMQPLAIN", args.mechanism);
                assert_eq!("en_US", args.locale);
                assert_eq!(frame::amqplain_response("guest", "guest"), args.response);
            }
            other => panic!("Expected StartOk, got {:?}", other),
        }
        match &frames[2] {
            AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionTuneOk(args)) => {
                assert_eq!(0, args.channel_max);
                assert_eq!(131_072, args.frame_max);
                assert_eq!(0, args.heartbeat);
            }
            other => panic!("Expected TuneOk, got {:?}", other),
        }
        match &frames[3] {
            AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionOpen(args)) => {
                assert_eq!("/", args.virtual_host);
                assert!(args.insist);
            }
            other => panic!("Expected Open, got {:?}", other),
        }

        assert!(!conn.is_started());

        cs.connection_open_ok().await.unwrap();

        assert!(conn.is_started());
    }

    #[tokio::test]
    async fn startup_hooks_fire_once_per_handshake() {
        let (mut cs, _rx, conn) = test_state();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        conn.do_when_startup(move |_conn| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        handshake(&mut cs).await;

        assert_eq!(1, fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn queue_ops_wait_for_channel_open_and_declare_ok() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        drain(&mut rx);

        cs.handle_request(request(Param::OpenChannel(1))).await.unwrap();
        cs.handle_request(request(Param::DeclareQueue {
            channel: 1,
            slot: 0,
            name: Some("q".into()),
            opts: QueueOptions::default(),
        }))
        .await
        .unwrap();
        cs.handle_request(request(Param::Publish {
            channel: 1,
            slot: 0,
            content: Content::new("hello"),
            opts: PublishOptions::default(),
        }))
        .await
        .unwrap();

        // nothing but the channel open may hit the wire yet
        let frames = drain(&mut rx);
        assert_eq!(1, frames.len());
        assert!(matches!(frames[0], AMQPFrame::Method(1, frame::CHANNEL_OPEN, _)));

        cs.handle_frame(AMQPFrame::Method(1, frame::CHANNEL_OPEN_OK, MethodFrameArgs::ChannelOpenOk))
            .await
            .unwrap();

        // the declare is next, the publish still waits for the queue
        let frames = drain(&mut rx);
        assert_eq!(1, frames.len());
        match &frames[0] {
            AMQPFrame::Method(1, _, MethodFrameArgs::QueueDeclare(args)) => {
                assert_eq!("q", args.name);
                assert!(args.flags.contains(QueueDeclareFlags::EXCLUSIVE));
                assert!(args.flags.contains(QueueDeclareFlags::AUTO_DELETE));
            }
            other => panic!("Expected Queue.Declare, got {:?}", other),
        }

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::QUEUE_DECLARE_OK,
            MethodFrameArgs::QueueDeclareOk(QueueDeclareOkArgs {
                name: "q".into(),
                ..Default::default()
            }),
        ))
        .await
        .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(3, frames.len());
        match &frames[0] {
            AMQPFrame::Method(1, _, MethodFrameArgs::BasicPublish(args)) => {
                assert_eq!("q", args.routing_key);
            }
            other => panic!("Expected Basic.Publish, got {:?}", other),
        }
        match &frames[1] {
            AMQPFrame::ContentHeader(h) => assert_eq!(5, h.body_size),
            other => panic!("Expected content header, got {:?}", other),
        }
        match &frames[2] {
            AMQPFrame::ContentBody(b) => assert_eq!(b"hello".to_vec(), b.body),
            other => panic!("Expected content body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn synchronous_requests_are_serialized_per_channel() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        cs.handle_request(request(Param::OpenChannel(1))).await.unwrap();
        cs.handle_frame(AMQPFrame::Method(1, frame::CHANNEL_OPEN_OK, MethodFrameArgs::ChannelOpenOk))
            .await
            .unwrap();
        drain(&mut rx);

        cs.handle_request(request(Param::DeclareQueue {
            channel: 1,
            slot: 0,
            name: Some("q1".into()),
            opts: QueueOptions::default(),
        }))
        .await
        .unwrap();
        cs.handle_request(request(Param::DeclareQueue {
            channel: 1,
            slot: 1,
            name: Some("q2".into()),
            opts: QueueOptions::default(),
        }))
        .await
        .unwrap();

        // the second declare waits in the gate until the first is replied
        let frames = drain(&mut rx);
        assert_eq!(1, frames.len());

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::QUEUE_DECLARE_OK,
            MethodFrameArgs::QueueDeclareOk(QueueDeclareOkArgs {
                name: "q1".into(),
                ..Default::default()
            }),
        ))
        .await
        .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(1, frames.len());
        match &frames[0] {
            AMQPFrame::Method(1, _, MethodFrameArgs::QueueDeclare(args)) => assert_eq!("q2", args.name),
            other => panic!("Expected the deferred Queue.Declare, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_named_queue_adopts_the_assigned_name() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        cs.handle_request(request(Param::OpenChannel(1))).await.unwrap();
        cs.handle_frame(AMQPFrame::Method(1, frame::CHANNEL_OPEN_OK, MethodFrameArgs::ChannelOpenOk))
            .await
            .unwrap();
        drain(&mut rx);

        cs.handle_request(request(Param::DeclareQueue {
            channel: 1,
            slot: 0,
            name: None,
            opts: QueueOptions::default(),
        }))
        .await
        .unwrap();

        let callback: ConsumerCallback = Box::new(|_delivery| Box::pin(async { ConsumerAck::Nothing }));

        cs.handle_request(request(Param::Subscribe {
            channel: 1,
            slot: 0,
            callback,
            opts: ConsumeOptions::default(),
        }))
        .await
        .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(1, frames.len());
        match &frames[0] {
            AMQPFrame::Method(1, _, MethodFrameArgs::QueueDeclare(args)) => assert_eq!("", args.name),
            other => panic!("Expected Queue.Declare, got {:?}", other),
        }

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::QUEUE_DECLARE_OK,
            MethodFrameArgs::QueueDeclareOk(QueueDeclareOkArgs {
                name: "amq.gen-xyz".into(),
                ..Default::default()
            }),
        ))
        .await
        .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(1, frames.len());
        let tag = match &frames[0] {
            AMQPFrame::Method(1, _, MethodFrameArgs::BasicConsume(args)) => {
                assert_eq!("amq.gen-xyz", args.queue);
                assert!(args.flags.contains(BasicConsumeFlags::NO_ACK));
                args.consumer_tag.clone()
            }
            other => panic!("Expected Basic.Consume, got {:?}", other),
        };

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::BASIC_CONSUME_OK,
            MethodFrameArgs::BasicConsumeOk(BasicConsumeOkArgs {
                consumer_tag: tag.clone(),
            }),
        ))
        .await
        .unwrap();

        let ch = cs.channels.get(&1).unwrap();

        assert!(ch.queue_names.contains_key("amq.gen-xyz"));
        assert!(ch.consumers.contains_key(&tag));
    }

    #[tokio::test]
    async fn delivered_content_is_collected_and_acked() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        open_channel_with_queue(&mut cs, &mut rx).await;

        let (body_tx, mut body_rx) = mpsc::unbounded_channel();
        let callback: ConsumerCallback = Box::new(move |delivery| {
            let tx = body_tx.clone();
            Box::pin(async move {
                tx.send((delivery.body.clone(), delivery.chunks.len(), delivery.queue.clone()))
                    .unwrap();
                ConsumerAck::Ack
            })
        });
        let tag = subscribe(&mut cs, &mut rx, callback, ConsumeOptions::default().no_ack(false)).await;

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::BASIC_DELIVER,
            MethodFrameArgs::BasicDeliver(BasicDeliverArgs::new(&tag, 42, "")),
        ))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::ContentHeader(ContentHeaderFrame {
            channel: 1,
            body_size: 6,
            ..Default::default()
        }))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::ContentBody(ContentBodyFrame {
            channel: 1,
            body: b"abc".to_vec(),
        }))
        .await
        .unwrap();

        // half the body received, nothing dispatched yet
        assert!(body_rx.try_recv().is_err());

        cs.handle_frame(AMQPFrame::ContentBody(ContentBodyFrame {
            channel: 1,
            body: b"def".to_vec(),
        }))
        .await
        .unwrap();

        let (body, chunk_count, queue) = body_rx.try_recv().unwrap();

        assert_eq!(b"abcdef".to_vec(), body);
        assert_eq!(2, chunk_count);
        assert_eq!("q", queue);

        let frames = drain(&mut rx);
        assert_eq!(1, frames.len());
        match &frames[0] {
            AMQPFrame::Method(1, _, MethodFrameArgs::BasicAck(args)) => {
                assert_eq!(42, args.delivery_tag);
                assert!(!args.multiple);
            }
            other => panic!("Expected Basic.Ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reject_return_value_emits_basic_reject_with_requeue() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        open_channel_with_queue(&mut cs, &mut rx).await;

        let callback: ConsumerCallback = Box::new(|_delivery| Box::pin(async { ConsumerAck::Reject }));
        let tag = subscribe(&mut cs, &mut rx, callback, ConsumeOptions::default().no_ack(false)).await;

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::BASIC_DELIVER,
            MethodFrameArgs::BasicDeliver(BasicDeliverArgs::new(&tag, 7, "")),
        ))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::ContentHeader(ContentHeaderFrame {
            channel: 1,
            body_size: 2,
            ..Default::default()
        }))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::ContentBody(ContentBodyFrame {
            channel: 1,
            body: b"no".to_vec(),
        }))
        .await
        .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(1, frames.len());
        match &frames[0] {
            AMQPFrame::Method(1, _, MethodFrameArgs::BasicReject(args)) => {
                assert_eq!(7, args.delivery_tag);
                assert!(args.requeue);
            }
            other => panic!("Expected Basic.Reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn no_ack_consumers_ignore_the_return_value() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        open_channel_with_queue(&mut cs, &mut rx).await;

        let callback: ConsumerCallback = Box::new(|_delivery| Box::pin(async { ConsumerAck::Ack }));
        let tag = subscribe(&mut cs, &mut rx, callback, ConsumeOptions::default()).await;

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::BASIC_DELIVER,
            MethodFrameArgs::BasicDeliver(BasicDeliverArgs::new(&tag, 9, "")),
        ))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::ContentHeader(ContentHeaderFrame {
            channel: 1,
            body_size: 2,
            ..Default::default()
        }))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::ContentBody(ContentBodyFrame {
            channel: 1,
            body: b"ok".to_vec(),
        }))
        .await
        .unwrap();

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn method_frame_during_content_collection_is_dropped() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        open_channel_with_queue(&mut cs, &mut rx).await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let callback: ConsumerCallback = Box::new(move |delivery| {
            let tx = seen_tx.clone();
            Box::pin(async move {
                tx.send(delivery.deliver.delivery_tag).unwrap();
                ConsumerAck::Nothing
            })
        });
        let tag = subscribe(&mut cs, &mut rx, callback, ConsumeOptions::default()).await;

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::BASIC_DELIVER,
            MethodFrameArgs::BasicDeliver(BasicDeliverArgs::new(&tag, 1, "")),
        ))
        .await
        .unwrap();

        // a method frame in the middle of content collection violates the
        // protocol and is dropped without touching the assembly
        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::BASIC_DELIVER,
            MethodFrameArgs::BasicDeliver(BasicDeliverArgs::new(&tag, 2, "")),
        ))
        .await
        .unwrap();

        cs.handle_frame(AMQPFrame::ContentHeader(ContentHeaderFrame {
            channel: 1,
            body_size: 1,
            ..Default::default()
        }))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::ContentBody(ContentBodyFrame {
            channel: 1,
            body: b"x".to_vec(),
        }))
        .await
        .unwrap();

        assert_eq!(1, seen_rx.try_recv().unwrap());
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn returned_messages_are_dropped() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        open_channel_with_queue(&mut cs, &mut rx).await;

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::BASIC_RETURN,
            MethodFrameArgs::BasicReturn(BasicReturnArgs {
                reply_code: 312,
                reply_text: "NO_ROUTE".into(),
                exchange_name: "".into(),
                routing_key: "nowhere".into(),
            }),
        ))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::ContentHeader(ContentHeaderFrame {
            channel: 1,
            body_size: 4,
            ..Default::default()
        }))
        .await
        .unwrap();
        cs.handle_frame(AMQPFrame::ContentBody(ContentBodyFrame {
            channel: 1,
            body: b"lost".to_vec(),
        }))
        .await
        .unwrap();

        assert!(drain(&mut rx).is_empty());
        assert!(cs.channels.get(&1).unwrap().assembly.is_none());
    }

    #[tokio::test]
    async fn channel_ready_signal_waits_for_open_ok() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        drain(&mut rx);

        let (tx, mut ready) = tokio::sync::oneshot::channel();

        cs.handle_request(request(Param::OpenChannel(1))).await.unwrap();
        cs.handle_request(ClientRequest {
            param: Param::ChannelReady(1),
            done: Some(tx),
        })
        .await
        .unwrap();

        assert!(ready.try_recv().is_err());

        cs.handle_frame(AMQPFrame::Method(1, frame::CHANNEL_OPEN_OK, MethodFrameArgs::ChannelOpenOk))
            .await
            .unwrap();

        ready.try_recv().unwrap().unwrap();
    }

    #[tokio::test]
    async fn graceful_stop_waits_for_close_ok() {
        let (mut cs, mut rx, conn) = test_state();

        handshake(&mut cs).await;
        drain(&mut rx);

        let (tx, done) = tokio::sync::oneshot::channel();

        cs.handle_request(ClientRequest {
            param: Param::Stop,
            done: Some(tx),
        })
        .await
        .unwrap();

        assert!(conn.is_stopping());

        let frames = drain(&mut rx);
        assert!(matches!(frames[0], AMQPFrame::Method(0, frame::CONNECTION_CLOSE, _)));
        assert!(cs.exit().is_none());

        cs.handle_frame(AMQPFrame::Method(0, frame::CONNECTION_CLOSE_OK, MethodFrameArgs::ConnectionCloseOk))
            .await
            .unwrap();

        assert_eq!(Some(LoopExit::Stopped), cs.exit());
        done.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn server_close_is_acknowledged_and_disconnects() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        drain(&mut rx);

        cs.handle_frame(AMQPFrame::Method(
            0,
            frame::CONNECTION_CLOSE,
            MethodFrameArgs::ConnectionClose(ConnectionCloseArgs {
                code: 320,
                text: "CONNECTION_FORCED".into(),
                class_id: 0,
                method_id: 0,
            }),
        ))
        .await
        .unwrap();

        let frames = drain(&mut rx);
        assert!(matches!(frames[0], AMQPFrame::Method(0, frame::CONNECTION_CLOSE_OK, _)));
        assert_eq!(Some(LoopExit::Disconnected), cs.exit());
    }

    #[tokio::test]
    async fn broker_channel_close_fires_hook_and_replies_close_ok() {
        let (mut cs, mut rx, _conn) = test_state();

        handshake(&mut cs).await;
        open_channel_with_queue(&mut cs, &mut rx).await;

        let (reason_tx, reason_rx) = std::sync::mpsc::channel();

        cs.handle_request(request(Param::SetCloseHook(
            1,
            Box::new(move |reason| {
                reason_tx.send(reason).unwrap();
            }),
        )))
        .await
        .unwrap();

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::CHANNEL_CLOSE,
            MethodFrameArgs::ChannelClose(ChannelCloseArgs {
                code: 404,
                text: "NOT_FOUND".into(),
                class_id: 0x32,
                method_id: 0x0A,
            }),
        ))
        .await
        .unwrap();

        let reason = reason_rx.try_recv().unwrap();
        assert!(reason.contains("code=404"));
        assert!(reason.contains("NOT_FOUND"));

        let frames = drain(&mut rx);
        assert!(matches!(frames[0], AMQPFrame::Method(1, frame::CHANNEL_CLOSE_OK, _)));
        assert!(cs.channels.is_empty());
    }

    #[tokio::test]
    async fn cascade_failure_stops_the_connection() {
        let (mut cs, mut rx, conn) = test_state();

        handshake(&mut cs).await;
        open_channel_with_queue(&mut cs, &mut rx).await;

        cs.handle_request(request(Param::SetCascadeFailure(1, true))).await.unwrap();

        cs.handle_frame(AMQPFrame::Method(
            1,
            frame::CHANNEL_CLOSE,
            MethodFrameArgs::ChannelClose(ChannelCloseArgs {
                code: 406,
                text: "PRECONDITION_FAILED".into(),
                class_id: 0,
                method_id: 0,
            }),
        ))
        .await
        .unwrap();

        assert!(conn.is_stopping());

        let frames = drain(&mut rx);
        assert!(matches!(frames[0], AMQPFrame::Method(0, frame::CONNECTION_CLOSE, _)));
    }
}
