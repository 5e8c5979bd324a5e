use crate::callbacks::ChannelCloseHook;
use crate::client_error;
use crate::channel::QueueOptions;
use crate::connection::Connection;
use crate::consumer::{ConsumeOptions, ConsumerCallback};
use crate::message::{Content, PublishOptions};
use crate::model::{ChannelNumber, QueueSlot};
use crate::state::ClientState;
use anyhow::{anyhow, Result};
use coppermq_codec::codec::{AMQPCodec, Frame};
use coppermq_codec::frame::{self, AMQPFrame, ExchangeDeclareArgs};
use futures::stream::StreamExt;
use futures::SinkExt;
use log::{debug, error};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;

pub(crate) type ClientRequestSink = mpsc::UnboundedSender<ClientRequest>;

/// Completion signal of a request. Synchronous requests fire it when the
/// reply frame lands, others right after the frames are admitted.
pub(crate) type ReplySink = oneshot::Sender<Result<()>>;

/// A request posted from the public handles into the event loop.
pub(crate) struct ClientRequest {
    pub(crate) param: Param,
    pub(crate) done: Option<ReplySink>,
}

pub(crate) enum Param {
    OpenChannel(ChannelNumber),
    SendBatch(ChannelNumber, Vec<AMQPFrame>),
    DeclareExchange(ChannelNumber, ExchangeDeclareArgs),
    DeclareQueue {
        channel: ChannelNumber,
        slot: QueueSlot,
        name: Option<String>,
        opts: QueueOptions,
    },
    BindQueue {
        channel: ChannelNumber,
        slot: QueueSlot,
        exchange: String,
        routing_key: Option<String>,
    },
    Subscribe {
        channel: ChannelNumber,
        slot: QueueSlot,
        callback: ConsumerCallback,
        opts: ConsumeOptions,
    },
    Publish {
        channel: ChannelNumber,
        slot: QueueSlot,
        content: Content,
        opts: PublishOptions,
    },
    CancelConsumer(ChannelNumber, String),
    /// No-op which completes once the channel is open; used for the
    /// channel-created hooks.
    ChannelReady(ChannelNumber),
    SetCascadeFailure(ChannelNumber, bool),
    SetCloseHook(ChannelNumber, ChannelCloseHook),
    CloseChannel(ChannelNumber),
    Stop,
    Shutdown,
}

impl Param {
    /// The queue a request operates on, for queue level deferral.
    pub(crate) fn queue_slot(&self) -> Option<(ChannelNumber, QueueSlot)> {
        match self {
            Param::BindQueue { channel, slot, .. }
            | Param::Subscribe { channel, slot, .. }
            | Param::Publish { channel, slot, .. } => Some((*channel, *slot)),
            _ => None,
        }
    }

    /// The channel a request belongs to, when it has to wait for the
    /// channel to be open.
    pub(crate) fn deferrable_channel(&self) -> Option<ChannelNumber> {
        match self {
            Param::SendBatch(channel, _)
            | Param::DeclareExchange(channel, _)
            | Param::CancelConsumer(channel, _)
            | Param::ChannelReady(channel)
            | Param::CloseChannel(channel) => Some(*channel),
            Param::DeclareQueue { channel, .. }
            | Param::BindQueue { channel, .. }
            | Param::Subscribe { channel, .. }
            | Param::Publish { channel, .. } => Some(*channel),
            _ => None,
        }
    }
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.param {
            Param::OpenChannel(ch) => write!(f, "Request{{OpenChannel({})}}", ch),
            Param::SendBatch(ch, frames) => {
                write!(f, "Request{{SendBatch(channel={}, frames={})}}", ch, frames.len())
            }
            Param::DeclareExchange(ch, args) => {
                write!(f, "Request{{DeclareExchange(channel={}, {:?})}}", ch, args)
            }
            Param::DeclareQueue { channel, slot, name, .. } => {
                write!(f, "Request{{DeclareQueue(channel={}, slot={}, name={:?})}}", channel, slot, name)
            }
            Param::BindQueue { channel, slot, exchange, .. } => {
                write!(f, "Request{{BindQueue(channel={}, slot={}, exchange={})}}", channel, slot, exchange)
            }
            Param::Subscribe { channel, slot, .. } => {
                write!(f, "Request{{Subscribe(channel={}, slot={})}}", channel, slot)
            }
            Param::Publish { channel, slot, .. } => {
                write!(f, "Request{{Publish(channel={}, slot={})}}", channel, slot)
            }
            Param::CancelConsumer(ch, tag) => {
                write!(f, "Request{{CancelConsumer(channel={}, tag={})}}", ch, tag)
            }
            Param::ChannelReady(ch) => write!(f, "Request{{ChannelReady({})}}", ch),
            Param::SetCascadeFailure(ch, mode) => {
                write!(f, "Request{{SetCascadeFailure(channel={}, {})}}", ch, mode)
            }
            Param::SetCloseHook(ch, _) => write!(f, "Request{{SetCloseHook(channel={})}}", ch),
            Param::CloseChannel(ch) => write!(f, "Request{{CloseChannel({})}}", ch),
            Param::Stop => write!(f, "Request{{Stop}}"),
            Param::Shutdown => write!(f, "Request{{Shutdown}}"),
        }
    }
}

/// How the socket loop finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// Clean shutdown requested by this side, no reconnect.
    Stopped,
    /// The peer went away or the transport failed.
    Disconnected,
}

/// Post a request and wait for its completion signal.
pub(crate) async fn call(sink: &ClientRequestSink, param: Param) -> Result<()> {
    let (tx, rx) = oneshot::channel();

    sink.send(ClientRequest {
        param,
        done: Some(tx),
    })
    .map_err(|_| anyhow!("Connection is closed"))?;

    match rx.await {
        Ok(result) => result,
        Err(_) => client_error!(None, 501, "Connection closed before reply", 0),
    }
}

/// Post a fire and forget request.
pub(crate) fn send(sink: &ClientRequestSink, param: Param) -> Result<()> {
    sink.send(ClientRequest { param, done: None })
        .map_err(|_| anyhow!("Connection is closed"))
}

/// Drive one connected socket until shutdown or transport failure.
///
/// All protocol state lives in [`ClientState`] owned by this task; the
/// writer half runs separately so slow peers do not stall frame handling.
pub(crate) async fn socket_loop<S>(
    socket: S,
    requests: &mut mpsc::UnboundedReceiver<ClientRequest>,
    conn: &Connection,
    reconnected: bool,
) -> Result<LoopExit>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, mut stream) = Framed::new(socket, AMQPCodec {}).split();
    let (out_tx, out_rx) = mpsc::channel(16);
    let writer = tokio::spawn(write_loop(sink, out_rx, conn.clone()));
    let mut client = ClientState::new(out_tx, conn.clone(), reconnected);

    client.start().await?;

    let exit = loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Frame::Frame(frame))) => {
                        conn.trace_incoming(&frame);

                        if let Err(e) = client.handle_frame(frame).await {
                            error!("Error handling frame: {:?}", e);
                        }
                    }
                    Some(Ok(Frame::Frames(frames))) => {
                        for frame in frames {
                            conn.trace_incoming(&frame);

                            if let Err(e) = client.handle_frame(frame).await {
                                error!("Error handling frame: {:?}", e);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error reading frame: {:?}", e);
                        break LoopExit::Disconnected;
                    }
                    None => {
                        break LoopExit::Disconnected;
                    }
                }
            }
            request = requests.recv() => {
                match request {
                    Some(request) => {
                        if let Err(e) = client.handle_request(request).await {
                            error!("Error handling request: {:?}", e);
                        }
                    }
                    None => {
                        // every handle dropped, nothing can reach us anymore
                        break LoopExit::Disconnected;
                    }
                }
            }
        }

        if let Some(exit) = client.exit() {
            break exit;
        }
    };

    // tears down the keepalive timer together with the writer
    writer.abort();

    Ok(exit)
}

/// Writer task: forwards outbound frames to the socket, fires the
/// frame-sent hooks and keeps the connection alive with heartbeats when
/// the outbound side goes idle.
async fn write_loop<S>(
    mut sink: futures::stream::SplitSink<Framed<S, AMQPCodec>, Frame>,
    mut outgoing: mpsc::Receiver<Frame>,
    conn: Connection,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let keepalive = conn.keepalive_seconds();
    let mut last_send = Instant::now();

    loop {
        let frame = if keepalive == 0 {
            match outgoing.recv().await {
                Some(frame) => Some(frame),
                None => break,
            }
        } else {
            let idle = last_send.elapsed().as_secs();

            if idle >= keepalive {
                Some(Frame::Frame(frame::heartbeat()))
            } else {
                tokio::select! {
                    out = outgoing.recv() => {
                        match out {
                            Some(frame) => Some(frame),
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(keepalive - idle)) => None,
                }
            }
        };

        if let Some(frame) = frame {
            conn.frame_written(&frame);

            if let Err(e) = sink.send(frame).await {
                error!("Error writing frame: {:?}", e);
                break;
            }

            last_send = Instant::now();
        }
    }

    debug!("Writer finished");
}
