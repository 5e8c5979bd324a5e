//! Asynchronous AMQP 0-8/0-9-1 client on the tokio runtime.
//!
//! The crate multiplexes many logical channels over one broker socket and
//! drives them from a single event loop task: the connection handshake,
//! the per-channel serialization of synchronous method exchanges, queue
//! and consumer bookkeeping, reconnection with exponential backoff and
//! keepalive heartbeats.
//!
//! Operations are deferred until the broker state allows them, so a queue
//! can be declared, subscribed and published to before the connection has
//! even started; the frames go out in order once the handshake and the
//! channel opening finish.
//!
//! # Examples
//!
//! ```no_run
//! use coppermq_client::*;
//!
//! async fn consume() -> Result<()> {
//!     let conn = Connection::create(ConnectionConfig::new("localhost").reconnect(true))?;
//!
//!     conn.do_when_startup(|conn: Connection| async move {
//!         let channel = conn.channel(None).unwrap();
//!         let queue = channel.queue(Some("jobs"), QueueOptions::default()).unwrap();
//!
//!         queue
//!             .subscribe(
//!                 |delivery: Delivery| async move {
//!                     println!("{:?}", delivery);
//!                     ConsumerAck::Ack
//!                 },
//!                 ConsumeOptions::default().no_ack(false),
//!             )
//!             .unwrap();
//!     });
//!
//!     conn.run().await
//! }
//! ```
mod callbacks;
mod channel;
mod config;
mod connection;
mod consumer;
mod error;
mod gate;
mod message;
mod model;
mod processor;
mod state;
mod tls;

pub mod dev;

pub use anyhow::Result;

pub use callbacks::{ChannelCloseHook, ConnectionHook, FrameSentHook};
pub use channel::{Channel, Queue, QueueOptions};
pub use config::{ConnectionConfig, DebugFlags};
pub use connection::Connection;
pub use consumer::{ConsumeOptions, ConsumerAck, Delivery};
pub use error::ClientError;
pub use message::{compose_publish, Content, MessageProperties, PublishOptions};
pub use model::{ChannelError, ChannelNumber, ClassId, ClassMethod, ConnectionError};
pub use tls::TlsAdaptor;

pub use coppermq_codec::frame;
pub use coppermq_codec::frame::AMQPFrame;
