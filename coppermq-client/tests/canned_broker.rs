//! End-to-end tests against a canned broker: a real TCP listener speaking
//! scripted AMQP frames through the codec.

use coppermq_client::*;
use coppermq_codec::codec::{AMQPCodec, Frame};
use coppermq_codec::frame::{self, AMQPFrame, MethodFrameArgs};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;

struct Broker {
    framed: Framed<TcpStream, AMQPCodec>,
}

impl Broker {
    async fn accept(listener: &TcpListener) -> Broker {
        let (socket, _) = listener.accept().await.unwrap();

        Broker {
            framed: Framed::new(socket, AMQPCodec {}),
        }
    }

    async fn recv(&mut self) -> AMQPFrame {
        match timeout(Duration::from_secs(5), self.framed.next()).await {
            Ok(Some(Ok(Frame::Frame(frame)))) => frame,
            other => panic!("Broker expected a frame, got {:?}", other),
        }
    }

    async fn send(&mut self, frame: AMQPFrame) {
        self.framed.send(Frame::Frame(frame)).await.unwrap();
    }

    /// Play the server side of the connection handshake, asserting the
    /// client replies required on the wire.
    async fn handshake(&mut self) {
        assert!(matches!(self.recv().await, AMQPFrame::Header));

        self.send(frame::ConnectionStartArgs::new().frame()).await;

        match self.recv().await {
            AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionStartOk(args)) => {
                assert_eq!("AMQPLAIN", args.mechanism);
                assert_eq!("en_US", args.locale);
                assert_eq!(frame::amqplain_response("guest", "guest"), args.response);
            }
            other => panic!("Expected Connection.StartOk, got {:?}", other),
        }

        self.send(
            frame::ConnectionTuneArgs {
                channel_max: 2047,
                frame_max: 131_072,
                heartbeat: 0,
            }
            .frame(),
        )
        .await;

        match self.recv().await {
            AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionTuneOk(args)) => {
                assert_eq!(0, args.channel_max);
                assert_eq!(131_072, args.frame_max);
                assert_eq!(0, args.heartbeat);
            }
            other => panic!("Expected Connection.TuneOk, got {:?}", other),
        }

        match self.recv().await {
            AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionOpen(args)) => {
                assert_eq!("/", args.virtual_host);
                assert!(args.insist);
            }
            other => panic!("Expected Connection.Open, got {:?}", other),
        }

        self.send(frame::connection_open_ok()).await;
    }
}

async fn listening_connection(config: impl FnOnce(ConnectionConfig) -> ConnectionConfig) -> (TcpListener, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let conn = Connection::create(config(ConnectionConfig::new("127.0.0.1").port(port))).unwrap();

    (listener, conn)
}

#[tokio::test]
async fn handshake_and_graceful_stop() {
    let (listener, conn) = listening_connection(|c| c).await;

    let startups = Arc::new(AtomicUsize::new(0));
    let counter = startups.clone();

    conn.do_when_startup(move |_conn| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let driver = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run().await }
    });

    let mut broker = Broker::accept(&listener).await;

    broker.handshake().await;

    // give the event loop a tick to run the startup hooks
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(conn.is_started());
    assert_eq!(1, startups.load(Ordering::SeqCst));

    let stopper = tokio::spawn({
        let conn = conn.clone();
        async move { conn.stop().await }
    });

    match broker.recv().await {
        AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionClose(args)) => assert_eq!(200, args.code),
        other => panic!("Expected Connection.Close, got {:?}", other),
    }

    broker.send(frame::connection_close_ok()).await;

    stopper.await.unwrap().unwrap();
    driver.await.unwrap().unwrap();

    assert!(conn.is_stopped());
    assert!(!conn.is_started());
}

#[tokio::test]
async fn declare_publish_consume_and_ack() {
    let (listener, conn) = listening_connection(|c| c).await;

    let (body_tx, mut body_rx) = tokio::sync::mpsc::unbounded_channel();

    conn.do_when_startup(move |conn: Connection| {
        let body_tx = body_tx.clone();
        async move {
            let channel = conn.channel(Some(1)).unwrap();
            let queue = channel.queue(Some("jobs"), QueueOptions::default()).unwrap();

            queue
                .subscribe(
                    move |delivery: Delivery| {
                        let body_tx = body_tx.clone();
                        async move {
                            body_tx.send((delivery.deliver.delivery_tag, delivery.body)).unwrap();
                            ConsumerAck::Ack
                        }
                    },
                    ConsumeOptions::default().no_ack(false),
                )
                .unwrap();

            queue.publish("hello", PublishOptions::default()).unwrap();
        }
    });

    let driver = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run().await }
    });

    let mut broker = Broker::accept(&listener).await;

    broker.handshake().await;

    // channel open before anything else on channel 1
    match broker.recv().await {
        AMQPFrame::Method(1, cm, MethodFrameArgs::ChannelOpen) => assert_eq!(frame::CHANNEL_OPEN, cm),
        other => panic!("Expected Channel.Open, got {:?}", other),
    }
    broker.send(frame::channel_open_ok(1)).await;

    // the declare waited for the channel
    match broker.recv().await {
        AMQPFrame::Method(1, _, MethodFrameArgs::QueueDeclare(args)) => assert_eq!("jobs", args.name),
        other => panic!("Expected Queue.Declare, got {:?}", other),
    }
    broker
        .send(frame::QueueDeclareOkArgs::default().name("jobs").frame(1))
        .await;

    // subscribe and publish waited for the queue; the consume holds the
    // gate but the publish is asynchronous and follows right after
    let consumer_tag = match broker.recv().await {
        AMQPFrame::Method(1, _, MethodFrameArgs::BasicConsume(args)) => {
            assert_eq!("jobs", args.queue);
            args.consumer_tag
        }
        other => panic!("Expected Basic.Consume, got {:?}", other),
    };

    match broker.recv().await {
        AMQPFrame::Method(1, _, MethodFrameArgs::BasicPublish(args)) => {
            assert_eq!("jobs", args.routing_key);
        }
        other => panic!("Expected Basic.Publish, got {:?}", other),
    }
    match broker.recv().await {
        AMQPFrame::ContentHeader(header) => assert_eq!(5, header.body_size),
        other => panic!("Expected content header, got {:?}", other),
    }
    match broker.recv().await {
        AMQPFrame::ContentBody(body) => assert_eq!(b"hello".to_vec(), body.body),
        other => panic!("Expected content body, got {:?}", other),
    }

    broker
        .send(frame::BasicConsumeOkArgs::new(&consumer_tag).frame(1))
        .await;

    // deliver a message back and expect the ack for it
    broker
        .send(frame::BasicDeliverArgs::new(&consumer_tag, 42, "").routing_key("jobs").frame(1))
        .await;
    broker
        .send(
            frame::ContentHeaderFrame {
                channel: 1,
                body_size: 5,
                ..Default::default()
            }
            .frame(),
        )
        .await;
    broker
        .send(
            frame::ContentBodyFrame {
                channel: 1,
                body: b"hello".to_vec(),
            }
            .frame(),
        )
        .await;

    match broker.recv().await {
        AMQPFrame::Method(1, _, MethodFrameArgs::BasicAck(args)) => {
            assert_eq!(42, args.delivery_tag);
        }
        other => panic!("Expected Basic.Ack, got {:?}", other),
    }

    let (delivery_tag, body) = body_rx.recv().await.unwrap();

    assert_eq!(42, delivery_tag);
    assert_eq!(b"hello".to_vec(), body);

    conn.shutdown().unwrap();
    driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn reconnects_with_backoff_after_connection_loss() {
    let (listener, conn) = listening_connection(|c| c.reconnect(true)).await;

    let reconnects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));

    {
        let counter = reconnects.clone();
        conn.on_reconnected(move |_conn| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    {
        let counter = disconnects.clone();
        conn.on_disconnected(move |_conn| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let driver = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run().await }
    });

    let mut broker = Broker::accept(&listener).await;
    broker.handshake().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(conn.is_started());

    // drop the socket mid-session
    let dropped_at = Instant::now();
    drop(broker);

    // the first retry is scheduled two seconds after the failure
    let mut broker = Broker::accept(&listener).await;
    let waited = dropped_at.elapsed();

    assert!(waited >= Duration::from_millis(1900), "reconnected after {:?}", waited);
    assert!(waited < Duration::from_secs(4), "reconnected after {:?}", waited);

    broker.handshake().await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(conn.is_started());
    assert_eq!(1, reconnects.load(Ordering::SeqCst));
    assert_eq!(1, disconnects.load(Ordering::SeqCst));

    conn.shutdown().unwrap();
    driver.await.unwrap().unwrap();
    assert!(conn.is_stopped());
}

#[tokio::test]
async fn keepalive_heartbeats_when_outbound_idle() {
    let (listener, conn) = listening_connection(|c| c.keepalive(1)).await;

    let driver = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run().await }
    });

    let mut broker = Broker::accept(&listener).await;
    broker.handshake().await;

    match timeout(Duration::from_secs(3), broker.recv()).await {
        Ok(AMQPFrame::Heartbeat(0)) => (),
        other => panic!("Expected a heartbeat, got {:?}", other),
    }

    conn.shutdown().unwrap();
    driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn frame_sent_hooks_observe_outbound_frames() {
    let (listener, conn) = listening_connection(|c| c).await;

    let sent = Arc::new(AtomicUsize::new(0));
    {
        let counter = sent.clone();
        conn.on_frame_sent(move |_frame| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    let driver = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run().await }
    });

    let mut broker = Broker::accept(&listener).await;
    broker.handshake().await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    // preface, start-ok, tune-ok and open went through the hook
    assert_eq!(4, sent.load(Ordering::SeqCst));

    conn.shutdown().unwrap();
    driver.await.unwrap().unwrap();
}
