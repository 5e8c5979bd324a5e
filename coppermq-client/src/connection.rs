use crate::callbacks::{self, connection_hook, CallbackRegistry, FrameSentHook};
use crate::channel::Channel;
use crate::client_error;
use crate::config::{ConnectionConfig, DebugFlags};
use crate::model::ChannelNumber;
use crate::processor::{self, ClientRequest, LoopExit, Param};
use anyhow::{anyhow, Result};
use coppermq_codec::codec::Frame;
use coppermq_codec::frame::AMQPFrame;
use log::{debug, error, info};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::ServerName;

/// Observable lifecycle flags, shared between the handles and the loop.
#[derive(Default)]
pub(crate) struct Status {
    started: AtomicBool,
    stopping: AtomicBool,
    stopped: AtomicBool,
}

impl Status {
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn set_started(&self, mode: bool) {
        self.started.store(mode, Ordering::SeqCst);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stopping(&self, mode: bool) {
        self.stopping.store(mode, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stopped(&self, mode: bool) {
        self.stopped.store(mode, Ordering::SeqCst);
    }
}

/// Channel id allocator over 1..=65535. `allocate` hands out the smallest
/// free id, `reserve` pins a caller chosen one.
pub(crate) struct ChannelIdPool {
    /// One bit per id, bit set means occupied.
    words: Vec<u64>,
}

const MAX_CHANNEL_ID: usize = 65535;

impl ChannelIdPool {
    pub(crate) fn new() -> Self {
        Self {
            words: vec![0; MAX_CHANNEL_ID / 64 + 1],
        }
    }

    fn position(id: ChannelNumber) -> (usize, u64) {
        let index = id as usize - 1;

        (index / 64, 1u64 << (index % 64))
    }

    pub(crate) fn allocate(&mut self) -> Option<ChannelNumber> {
        for (word_index, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let id = word_index * 64 + bit + 1;

                if id > MAX_CHANNEL_ID {
                    break;
                }

                *word |= 1u64 << bit;

                return Some(id as ChannelNumber);
            }
        }

        None
    }

    pub(crate) fn reserve(&mut self, id: ChannelNumber) -> bool {
        if id == 0 {
            return false;
        }

        let (word, mask) = Self::position(id);

        if self.words[word] & mask != 0 {
            false
        } else {
            self.words[word] |= mask;
            true
        }
    }

    pub(crate) fn release(&mut self, id: ChannelNumber) -> bool {
        if id == 0 {
            return false;
        }

        let (word, mask) = Self::position(id);

        if self.words[word] & mask == 0 {
            false
        } else {
            self.words[word] &= !mask;
            true
        }
    }

    pub(crate) fn is_occupied(&self, id: ChannelNumber) -> bool {
        if id == 0 {
            return false;
        }

        let (word, mask) = Self::position(id);

        self.words[word] & mask != 0
    }

    pub(crate) fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}

struct ChannelRegistry {
    pool: ChannelIdPool,
    handles: HashMap<ChannelNumber, Channel>,
}

struct Inner {
    config: ConnectionConfig,
    status: Status,
    hooks: CallbackRegistry,
    channels: Mutex<ChannelRegistry>,
    /// Taken by `run`, which owns the request stream for its lifetime.
    requests: Mutex<Option<mpsc::UnboundedReceiver<ClientRequest>>>,
}

/// An AMQP client connection.
///
/// `create` only validates the configuration; `run` opens the socket and
/// drives the protocol until the connection stops. The handle is cheap to
/// clone and every operation besides `run`/`stop` is fire and forget: it
/// is queued towards the event loop and deferred there until the broker
/// state allows it.
///
/// ```no_run
/// use coppermq_client::{Connection, ConnectionConfig, PublishOptions, QueueOptions};
///
/// async fn publisher() -> anyhow::Result<()> {
///     let conn = Connection::create(ConnectionConfig::new("localhost").reconnect(true))?;
///
///     conn.do_when_startup(|conn: Connection| async move {
///         let channel = conn.channel(None).unwrap();
///         let queue = channel.queue(Some("greetings"), QueueOptions::default()).unwrap();
///
///         queue.publish("hello", PublishOptions::default()).unwrap();
///     });
///
///     conn.run().await
/// }
/// ```
#[derive(Clone)]
pub struct Connection {
    sink: mpsc::UnboundedSender<ClientRequest>,
    inner: Arc<Inner>,
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// The broker addresses, shuffled once and rotated on every reconnect
/// attempt.
struct Endpoints {
    addresses: Vec<String>,
    index: usize,
}

impl Endpoints {
    fn new(config: &ConnectionConfig) -> Self {
        let port = config.effective_port();
        let mut addresses: Vec<String> = config
            .addresses
            .iter()
            .map(|host| {
                if host.contains(':') {
                    host.clone()
                } else {
                    format!("{}:{}", host, port)
                }
            })
            .collect();

        addresses.shuffle(&mut rand::thread_rng());

        Self { addresses, index: 0 }
    }

    fn current(&self) -> String {
        self.addresses[self.index].clone()
    }

    fn advance(&mut self) {
        self.index = (self.index + 1) % self.addresses.len();
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

async fn connect_transport(config: &ConnectionConfig, address: &str) -> Result<Transport> {
    let connect = TcpStream::connect(address);
    let stream = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("Connect timeout to {}", address)))??;

    match &config.tls {
        None => Ok(Transport::Plain(stream)),
        Some(tls) => {
            let server_name = ServerName::try_from(tls.domain.as_str())
                .map_err(|e| anyhow!("Invalid TLS domain {}: {:?}", tls.domain, e))?;
            let stream = tls.connector.connect(server_name, stream).await?;

            Ok(Transport::Tls(Box::new(stream)))
        }
    }
}

impl Connection {
    /// Validate the configuration and build the handle. The socket is not
    /// opened before `run`.
    pub fn create(config: ConnectionConfig) -> Result<Connection> {
        config.validate()?;

        let (sink, requests) = mpsc::unbounded_channel();

        Ok(Connection {
            sink,
            inner: Arc::new(Inner {
                config,
                status: Status::default(),
                hooks: CallbackRegistry::default(),
                channels: Mutex::new(ChannelRegistry {
                    pool: ChannelIdPool::new(),
                    handles: HashMap::new(),
                }),
                requests: Mutex::new(Some(requests)),
            }),
        })
    }

    /// Connect and drive the protocol until the connection stops.
    ///
    /// With `reconnect` enabled a lost connection is retried with an
    /// exponential backoff, rotating over the configured addresses; the
    /// loop only returns on `stop`/`shutdown` or when reconnecting is off.
    pub async fn run(&self) -> Result<()> {
        let mut requests = self
            .inner
            .requests
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("run() may only be called once"))?;

        let mut endpoints = Endpoints::new(&self.inner.config);
        let mut attempt: u32 = 0;
        let mut reconnected = false;

        loop {
            let address = endpoints.current();

            match connect_transport(&self.inner.config, &address).await {
                Ok(transport) => {
                    info!("Connected to {}", address);
                    attempt = 0;

                    let exit = match transport {
                        Transport::Plain(stream) => {
                            processor::socket_loop(stream, &mut requests, self, reconnected).await
                        }
                        Transport::Tls(stream) => {
                            processor::socket_loop(*stream, &mut requests, self, reconnected).await
                        }
                    };

                    self.inner.status.set_started(false);
                    self.clear_channels();

                    match exit {
                        Ok(LoopExit::Stopped) => {
                            self.inner.status.set_stopped(true);
                            debug!("Connection stopped");

                            return Ok(());
                        }
                        Ok(LoopExit::Disconnected) => error!("Disconnected from {}", address),
                        Err(ref e) => error!("Connection failed: {:?}", e),
                    }
                }
                Err(e) => error!("Failed to connect to {}: {:?}", address, e),
            }

            if self.is_stopping() {
                // losing the socket during a graceful stop is the expected
                // outcome, no disconnect event for that
                self.inner.status.set_stopped(true);

                return Ok(());
            }

            callbacks::fire(self.inner.hooks.disconnected_hooks(), self).await;

            if !self.inner.config.reconnect {
                self.inner.status.set_stopped(true);

                return Ok(());
            }

            attempt += 1;
            endpoints.advance();

            let delay = reconnect_delay(attempt);

            info!("Reconnect attempt {} in {} seconds", attempt, delay.as_secs());
            tokio::time::sleep(delay).await;

            reconnected = true;
        }
    }

    /// Graceful shutdown: `Connection.Close` is sent and the call returns
    /// when the broker confirmed with `CloseOk`.
    pub async fn stop(&self) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }

        self.inner.status.set_stopping(true);

        processor::call(&self.sink, Param::Stop).await
    }

    /// Immediate teardown: the socket is closed without the close
    /// handshake and the timers are cancelled.
    pub fn shutdown(&self) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }

        processor::send(&self.sink, Param::Shutdown)
    }

    /// Get an existing channel or open a new one. Without an id the
    /// smallest free id is taken; with an id the existing handle is
    /// returned when the channel is already open.
    pub fn channel(&self, id: Option<ChannelNumber>) -> Result<Channel> {
        let mut registry = self.inner.channels.lock().unwrap();

        match id {
            Some(0) => client_error!(None, 504, "Channel 0 is reserved for connection methods", 0),
            Some(id) => {
                if let Some(handle) = registry.handles.get(&id) {
                    return Ok(handle.clone());
                }

                registry.pool.reserve(id);

                let handle = Channel::new(id, self.sink.clone());

                registry.handles.insert(id, handle.clone());
                processor::send(&self.sink, Param::OpenChannel(id))?;

                Ok(handle)
            }
            None => match registry.pool.allocate() {
                Some(id) => {
                    let handle = Channel::new(id, self.sink.clone());

                    registry.handles.insert(id, handle.clone());
                    processor::send(&self.sink, Param::OpenChannel(id))?;

                    Ok(handle)
                }
                None => client_error!(None, 504, "Channel id space is exhausted", 0),
            },
        }
    }

    /// Send raw frames on a channel, `0` for connection level frames. The
    /// batch goes through the synchronous gate of the channel.
    pub fn send_frames(&self, channel: ChannelNumber, frames: Vec<AMQPFrame>) -> Result<()> {
        processor::send(&self.sink, Param::SendBatch(channel, frames))
    }

    pub fn is_started(&self) -> bool {
        self.inner.status.is_started()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.status.is_stopping()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.status.is_stopped()
    }

    /// Subscribe to the startup event. When the connection is already up
    /// the hook fires immediately as well; it stays subscribed and fires
    /// again after every successful handshake.
    pub fn do_when_startup<F, Fut>(&self, hook: F)
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook = connection_hook(hook);

        if self.is_started() {
            let conn = self.clone();
            let now = hook.clone();

            tokio::spawn(async move { now(conn).await });
        }

        self.inner.hooks.add_startup(hook);
    }

    /// Subscribe to the event fired after a successful reconnect.
    pub fn on_reconnected<F, Fut>(&self, hook: F)
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.hooks.add_reconnected(connection_hook(hook));
    }

    /// Subscribe to the event fired when the connection is lost.
    pub fn on_disconnected<F, Fut>(&self, hook: F)
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.hooks.add_disconnected(connection_hook(hook));
    }

    /// Subscribe to a hook invoked with every frame written to the socket.
    pub fn on_frame_sent<F>(&self, hook: F)
    where
        F: Fn(&AMQPFrame) + Send + Sync + 'static,
    {
        self.inner.hooks.add_frame_sent(Arc::new(hook) as FrameSentHook);
    }

    /////////////////////////////////////////////////////////////////////////
    // crate internals

    pub(crate) fn status(&self) -> &Status {
        &self.inner.status
    }

    pub(crate) fn hooks(&self) -> &CallbackRegistry {
        &self.inner.hooks
    }

    pub(crate) fn credentials(&self) -> (String, String) {
        (self.inner.config.username.clone(), self.inner.config.password.clone())
    }

    pub(crate) fn virtual_host(&self) -> String {
        self.inner.config.virtual_host.clone()
    }

    pub(crate) fn debug_flags(&self) -> DebugFlags {
        self.inner.config.debug
    }

    pub(crate) fn keepalive_seconds(&self) -> u64 {
        self.inner.config.keepalive
    }

    pub(crate) fn release_channel(&self, id: ChannelNumber) {
        let mut registry = self.inner.channels.lock().unwrap();

        registry.pool.release(id);
        registry.handles.remove(&id);
    }

    fn clear_channels(&self) {
        let mut registry = self.inner.channels.lock().unwrap();

        registry.pool.clear();
        registry.handles.clear();
    }

    pub(crate) fn trace_incoming(&self, frame: &AMQPFrame) {
        if self.debug_flags().contains(DebugFlags::FRAME_INPUT) {
            debug!("RECV {:?}", frame);
        }
    }

    pub(crate) fn frame_written(&self, frame: &Frame) {
        match frame {
            Frame::Frame(frame) => self.one_frame_written(frame),
            Frame::Frames(frames) => {
                for frame in frames {
                    self.one_frame_written(frame);
                }
            }
        }
    }

    fn one_frame_written(&self, frame: &AMQPFrame) {
        if self.debug_flags().contains(DebugFlags::FRAME_OUTPUT) {
            debug!("SENT {:?}", frame);
        }

        self.inner.hooks.frame_sent(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_allocates_the_smallest_free_id() {
        let mut pool = ChannelIdPool::new();

        assert_eq!(Some(1), pool.allocate());
        assert_eq!(Some(2), pool.allocate());
        assert_eq!(Some(3), pool.allocate());

        assert!(pool.release(2));

        assert_eq!(Some(2), pool.allocate());
        assert_eq!(Some(4), pool.allocate());
    }

    #[test]
    fn pool_reserve_and_release() {
        let mut pool = ChannelIdPool::new();

        assert!(pool.reserve(100));
        assert!(!pool.reserve(100));
        assert!(pool.is_occupied(100));

        // allocation skips the reserved id space
        for expected in 1..100u16 {
            assert_eq!(Some(expected), pool.allocate());
        }
        assert_eq!(Some(101), pool.allocate());

        assert!(pool.release(100));
        assert!(!pool.release(100));
    }

    #[test]
    fn pool_refuses_channel_zero() {
        let mut pool = ChannelIdPool::new();

        assert!(!pool.reserve(0));
        assert!(!pool.release(0));
        assert!(!pool.is_occupied(0));
    }

    #[test]
    fn pool_is_exhaustible() {
        let mut pool = ChannelIdPool::new();

        for _ in 0..65535 {
            assert!(pool.allocate().is_some());
        }

        assert_eq!(None, pool.allocate());

        pool.clear();

        assert_eq!(Some(1), pool.allocate());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(Duration::from_secs(2), reconnect_delay(1));
        assert_eq!(Duration::from_secs(4), reconnect_delay(2));
        assert_eq!(Duration::from_secs(8), reconnect_delay(3));
    }

    #[test]
    fn same_channel_id_returns_the_same_handle() {
        let conn = Connection::create(crate::ConnectionConfig::new("localhost")).unwrap();

        let ch1 = conn.channel(Some(5)).unwrap();
        let ch2 = conn.channel(Some(5)).unwrap();

        assert_eq!(ch1.number(), ch2.number());

        // fresh allocations take the smallest free ids around it
        assert_eq!(1, conn.channel(None).unwrap().number());
        assert_eq!(2, conn.channel(None).unwrap().number());

        assert!(conn.channel(Some(0)).is_err());
    }
}
