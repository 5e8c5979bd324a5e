use crate::frame::*;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const FRAME_METHOD: u8 = 0x01;
const FRAME_CONTENT_HEADER: u8 = 0x02;
const FRAME_CONTENT_BODY: u8 = 0x03;
const FRAME_HEARTBEAT: u8 = 0x08;
const FRAME_PROTOCOL_HEADER: u8 = 0x41;
const FRAME_END: u8 = 0xCE;

/// AMQP 0-9-1 encoder and decoder.
pub struct AMQPCodec {}

#[derive(Debug)]
pub enum Frame {
    Frame(AMQPFrame),
    Frames(Vec<AMQPFrame>),
}

impl Encoder<Frame> for AMQPCodec {
    type Error = io::Error;

    fn encode(&mut self, event: Frame, mut buf: &mut BytesMut) -> Result<(), Self::Error> {
        match event {
            Frame::Frame(frame) => encode_amqp_frame(&mut buf, frame),
            Frame::Frames(frames) => {
                for frame in frames {
                    encode_amqp_frame(&mut buf, frame);
                }
            }
        }

        Ok(())
    }
}

impl Decoder for AMQPCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Frames are length prefixed, so an incomplete buffer is kept
        // until the rest of the frame arrives.
        if src.len() < 8 || !is_full_frame(src) {
            return Ok(None);
        }

        match src.get_u8() {
            FRAME_METHOD => {
                let channel = src.get_u16();
                let frame_len = src.get_u32() as usize;
                let mut frame_buf = src.split_to(frame_len);
                let frame = decode_method_frame(&mut frame_buf, channel)?;

                expect_frame_end(src)?;

                Ok(Some(Frame::Frame(frame)))
            }
            FRAME_CONTENT_HEADER => {
                let channel = src.get_u16();
                let frame_len = src.get_u32() as usize;
                let mut frame_buf = src.split_to(frame_len);
                let frame = decode_content_header_frame(&mut frame_buf, channel);

                expect_frame_end(src)?;

                Ok(Some(Frame::Frame(frame)))
            }
            FRAME_CONTENT_BODY => {
                let channel = src.get_u16();
                let body_len = src.get_u32() as usize;
                let body = src.split_to(body_len).to_vec();

                expect_frame_end(src)?;

                Ok(Some(Frame::Frame(AMQPFrame::ContentBody(ContentBodyFrame {
                    channel,
                    body,
                }))))
            }
            FRAME_HEARTBEAT => {
                let channel = src.get_u16();
                let len = src.get_u32() as usize;
                let _ = src.split_to(len);

                expect_frame_end(src)?;

                Ok(Some(Frame::Frame(AMQPFrame::Heartbeat(channel))))
            }
            FRAME_PROTOCOL_HEADER => {
                let mut head = [0u8; 7];
                src.copy_to_slice(&mut head);

                Ok(Some(Frame::Frame(AMQPFrame::Header)))
            }
            f => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown frame type {}", f),
            )),
        }
    }
}

/// Check if the buffer contains a whole frame. Apart from the protocol
/// header every frame carries its payload length at offset 3.
fn is_full_frame(src: &BytesMut) -> bool {
    match src[0] {
        FRAME_PROTOCOL_HEADER => src.len() >= 8,
        _ => {
            let mut bs = [0u8; 4];
            bs.copy_from_slice(&src[3..7]);

            let len = u32::from_be_bytes(bs) as usize;

            src.len() >= len + 8
        }
    }
}

fn expect_frame_end(src: &mut BytesMut) -> Result<(), io::Error> {
    let octet = src.get_u8();

    if octet != FRAME_END {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Expected frame end, got {:02X}", octet),
        ));
    }

    Ok(())
}

fn decode_method_frame(mut src: &mut BytesMut, channel: u16) -> Result<AMQPFrame, io::Error> {
    let class_method = src.get_u32();

    let method_frame_args = match class_method {
        CONNECTION_START => decode_connection_start(&mut src),
        CONNECTION_START_OK => decode_connection_start_ok(&mut src),
        CONNECTION_TUNE => decode_connection_tune(&mut src),
        CONNECTION_TUNE_OK => decode_connection_tune_ok(&mut src),
        CONNECTION_OPEN => decode_connection_open(&mut src),
        CONNECTION_OPEN_OK => {
            let _ = decode_short_string(&mut src);
            MethodFrameArgs::ConnectionOpenOk
        }
        CONNECTION_CLOSE => decode_connection_close(&mut src),
        CONNECTION_CLOSE_OK => MethodFrameArgs::ConnectionCloseOk,
        CHANNEL_OPEN => {
            let _ = decode_short_string(&mut src);
            MethodFrameArgs::ChannelOpen
        }
        CHANNEL_OPEN_OK => {
            let _ = decode_long_string(&mut src);
            MethodFrameArgs::ChannelOpenOk
        }
        CHANNEL_CLOSE => decode_channel_close(&mut src),
        CHANNEL_CLOSE_OK => MethodFrameArgs::ChannelCloseOk,
        EXCHANGE_DECLARE => decode_exchange_declare(&mut src),
        EXCHANGE_DECLARE_OK => MethodFrameArgs::ExchangeDeclareOk,
        QUEUE_DECLARE => decode_queue_declare(&mut src),
        QUEUE_DECLARE_OK => decode_queue_declare_ok(&mut src),
        QUEUE_BIND => decode_queue_bind(&mut src),
        QUEUE_BIND_OK => MethodFrameArgs::QueueBindOk,
        BASIC_CONSUME => decode_basic_consume(&mut src),
        BASIC_CONSUME_OK => MethodFrameArgs::BasicConsumeOk(BasicConsumeOkArgs {
            consumer_tag: decode_short_string(&mut src),
        }),
        BASIC_CANCEL => decode_basic_cancel(&mut src),
        BASIC_CANCEL_OK => MethodFrameArgs::BasicCancelOk(BasicCancelOkArgs {
            consumer_tag: decode_short_string(&mut src),
        }),
        BASIC_PUBLISH => decode_basic_publish(&mut src),
        BASIC_RETURN => decode_basic_return(&mut src),
        BASIC_DELIVER => decode_basic_deliver(&mut src),
        BASIC_ACK => MethodFrameArgs::BasicAck(BasicAckArgs {
            delivery_tag: src.get_u64(),
            multiple: src.get_u8() != 0,
        }),
        BASIC_REJECT => MethodFrameArgs::BasicReject(BasicRejectArgs {
            delivery_tag: src.get_u64(),
            requeue: src.get_u8() != 0,
        }),
        cm => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown class method {:08X}", cm),
            ))
        }
    };

    Ok(AMQPFrame::Method(channel, class_method, method_frame_args))
}

fn decode_connection_start(mut src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::ConnectionStart(ConnectionStartArgs {
        version_major: src.get_u8(),
        version_minor: src.get_u8(),
        properties: decode_field_table(&mut src),
        mechanisms: decode_long_string(&mut src),
        locales: decode_long_string(&mut src),
    })
}

fn decode_connection_start_ok(mut src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::ConnectionStartOk(ConnectionStartOkArgs {
        properties: decode_field_table(&mut src),
        mechanism: decode_short_string(&mut src),
        response: decode_long_bytes(&mut src),
        locale: decode_short_string(&mut src),
    })
}

fn decode_connection_tune(src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::ConnectionTune(ConnectionTuneArgs {
        channel_max: src.get_u16(),
        frame_max: src.get_u32(),
        heartbeat: src.get_u16(),
    })
}

fn decode_connection_tune_ok(src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::ConnectionTuneOk(ConnectionTuneOkArgs {
        channel_max: src.get_u16(),
        frame_max: src.get_u32(),
        heartbeat: src.get_u16(),
    })
}

fn decode_connection_open(mut src: &mut BytesMut) -> MethodFrameArgs {
    let virtual_host = decode_short_string(&mut src);
    let _reserved = decode_short_string(&mut src);
    let flags = src.get_u8();

    MethodFrameArgs::ConnectionOpen(ConnectionOpenArgs {
        virtual_host,
        insist: flags & 0x01 != 0,
    })
}

fn decode_connection_close(mut src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::ConnectionClose(ConnectionCloseArgs {
        code: src.get_u16(),
        text: decode_short_string(&mut src),
        class_id: src.get_u16(),
        method_id: src.get_u16(),
    })
}

fn decode_channel_close(mut src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::ChannelClose(ChannelCloseArgs {
        code: src.get_u16(),
        text: decode_short_string(&mut src),
        class_id: src.get_u16(),
        method_id: src.get_u16(),
    })
}

fn decode_exchange_declare(mut src: &mut BytesMut) -> MethodFrameArgs {
    let _ = src.get_u16();

    MethodFrameArgs::ExchangeDeclare(ExchangeDeclareArgs {
        exchange_name: decode_short_string(&mut src),
        exchange_type: decode_short_string(&mut src),
        flags: ExchangeDeclareFlags::from_bits(src.get_u8()).unwrap_or_default(),
        args: decode_field_table(&mut src),
    })
}

fn decode_queue_declare(mut src: &mut BytesMut) -> MethodFrameArgs {
    let _ = src.get_u16();

    MethodFrameArgs::QueueDeclare(QueueDeclareArgs {
        name: decode_short_string(&mut src),
        flags: QueueDeclareFlags::from_bits(src.get_u8()).unwrap_or_default(),
        args: decode_field_table(&mut src),
    })
}

fn decode_queue_declare_ok(mut src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::QueueDeclareOk(QueueDeclareOkArgs {
        name: decode_short_string(&mut src),
        message_count: src.get_u32(),
        consumer_count: src.get_u32(),
    })
}

fn decode_queue_bind(mut src: &mut BytesMut) -> MethodFrameArgs {
    let _ = src.get_u16();

    MethodFrameArgs::QueueBind(QueueBindArgs {
        queue_name: decode_short_string(&mut src),
        exchange_name: decode_short_string(&mut src),
        routing_key: decode_short_string(&mut src),
        no_wait: src.get_u8() != 0,
        args: decode_field_table(&mut src),
    })
}

fn decode_basic_consume(mut src: &mut BytesMut) -> MethodFrameArgs {
    let _ = src.get_u16();

    MethodFrameArgs::BasicConsume(BasicConsumeArgs {
        queue: decode_short_string(&mut src),
        consumer_tag: decode_short_string(&mut src),
        flags: BasicConsumeFlags::from_bits(src.get_u8()).unwrap_or_default(),
        args: decode_field_table(&mut src),
    })
}

fn decode_basic_cancel(mut src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::BasicCancel(BasicCancelArgs {
        consumer_tag: decode_short_string(&mut src),
        no_wait: src.get_u8() != 0,
    })
}

fn decode_basic_publish(mut src: &mut BytesMut) -> MethodFrameArgs {
    let _ = src.get_u16();

    MethodFrameArgs::BasicPublish(BasicPublishArgs {
        exchange_name: decode_short_string(&mut src),
        routing_key: decode_short_string(&mut src),
        flags: BasicPublishFlags::from_bits(src.get_u8()).unwrap_or_default(),
    })
}

fn decode_basic_return(mut src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::BasicReturn(BasicReturnArgs {
        reply_code: src.get_u16(),
        reply_text: decode_short_string(&mut src),
        exchange_name: decode_short_string(&mut src),
        routing_key: decode_short_string(&mut src),
    })
}

fn decode_basic_deliver(mut src: &mut BytesMut) -> MethodFrameArgs {
    MethodFrameArgs::BasicDeliver(BasicDeliverArgs {
        consumer_tag: decode_short_string(&mut src),
        delivery_tag: src.get_u64(),
        redelivered: src.get_u8() != 0,
        exchange_name: decode_short_string(&mut src),
        routing_key: decode_short_string(&mut src),
    })
}

fn decode_content_header_frame(mut src: &mut BytesMut, channel: u16) -> AMQPFrame {
    let class_id = src.get_u16();
    let weight = src.get_u16();
    let body_size = src.get_u64();
    let prop_flags = HeaderPropertyFlags::from_bits_truncate(src.get_u16());

    let mut header = ContentHeaderFrame {
        channel,
        class_id,
        weight,
        body_size,
        prop_flags,
        ..Default::default()
    };

    // Properties are laid out from the most significant flag bit down.
    if prop_flags.contains(HeaderPropertyFlags::CONTENT_TYPE) {
        header.content_type = Some(decode_short_string(&mut src));
    }
    if prop_flags.contains(HeaderPropertyFlags::CONTENT_ENCODING) {
        header.content_encoding = Some(decode_short_string(&mut src));
    }
    if prop_flags.contains(HeaderPropertyFlags::HEADERS) {
        header.headers = decode_field_table(&mut src);
    }
    if prop_flags.contains(HeaderPropertyFlags::DELIVERY_MODE) {
        header.delivery_mode = Some(src.get_u8());
    }
    if prop_flags.contains(HeaderPropertyFlags::PRIORITY) {
        header.priority = Some(src.get_u8());
    }
    if prop_flags.contains(HeaderPropertyFlags::CORRELATION_ID) {
        header.correlation_id = Some(decode_short_string(&mut src));
    }
    if prop_flags.contains(HeaderPropertyFlags::REPLY_TO) {
        header.reply_to = Some(decode_short_string(&mut src));
    }
    if prop_flags.contains(HeaderPropertyFlags::EXPIRATION) {
        header.expiration = Some(decode_short_string(&mut src));
    }
    if prop_flags.contains(HeaderPropertyFlags::MESSAGE_ID) {
        header.message_id = Some(decode_short_string(&mut src));
    }
    if prop_flags.contains(HeaderPropertyFlags::TIMESTAMP) {
        header.timestamp = Some(src.get_u64());
    }
    if prop_flags.contains(HeaderPropertyFlags::MESSAGE_TYPE) {
        header.message_type = Some(decode_short_string(&mut src));
    }
    if prop_flags.contains(HeaderPropertyFlags::USER_ID) {
        header.user_id = Some(decode_short_string(&mut src));
    }
    if prop_flags.contains(HeaderPropertyFlags::APP_ID) {
        header.app_id = Some(decode_short_string(&mut src));
    }
    if prop_flags.contains(HeaderPropertyFlags::CLUSTER_ID) {
        header.cluster_id = Some(decode_short_string(&mut src));
    }

    AMQPFrame::ContentHeader(header)
}

fn decode_value(mut buf: &mut BytesMut) -> Result<AMQPFieldValue, io::Error> {
    match buf.get_u8() {
        b't' => Ok(AMQPFieldValue::Bool(buf.get_u8() != 0)),
        b'S' => Ok(AMQPFieldValue::LongString(decode_long_string(&mut buf))),
        b'F' => match decode_field_table(&mut buf) {
            None => Ok(AMQPFieldValue::EmptyFieldTable),
            Some(table) => Ok(AMQPFieldValue::FieldTable(Box::new(table))),
        },
        t => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unknown field value type {}", t),
        )),
    }
}

fn decode_short_string(buf: &mut BytesMut) -> String {
    let len = buf.get_u8() as usize;
    let sb = buf.split_to(len);

    String::from_utf8_lossy(&sb).to_string()
}

fn decode_long_string(buf: &mut BytesMut) -> String {
    let len = buf.get_u32() as usize;
    let sb = buf.split_to(len);

    String::from_utf8_lossy(&sb).to_string()
}

fn decode_long_bytes(buf: &mut BytesMut) -> Vec<u8> {
    let len = buf.get_u32() as usize;

    buf.split_to(len).to_vec()
}

/// Decode a field table
///
/// The buffer points to the beginning of the field table which is a `u32` length
/// information.
fn decode_field_table(buf: &mut BytesMut) -> Option<HashMap<String, AMQPFieldValue>> {
    let ft_len = buf.get_u32() as usize;

    if ft_len == 0 {
        return None;
    }

    let mut ft_buf = buf.split_to(ft_len);
    let mut table = HashMap::new();

    while ft_buf.has_remaining() {
        let field_name = decode_short_string(&mut ft_buf);

        match decode_value(&mut ft_buf) {
            Ok(field_value) => {
                table.insert(field_name, field_value);
            }
            Err(_) => break,
        }
    }

    Some(table)
}

fn encode_amqp_frame(mut buf: &mut BytesMut, frame: AMQPFrame) {
    match frame {
        AMQPFrame::Header => buf.put(&b"AMQP\x00\x00\x09\x01"[..]),

        AMQPFrame::Method(ch, cm, args) => encode_method_frame(&mut buf, ch, cm, &args),

        AMQPFrame::ContentHeader(header_frame) => encode_content_header_frame(&mut buf, &header_frame),

        AMQPFrame::ContentBody(body_frame) => encode_content_body_frame(&mut buf, &body_frame),

        AMQPFrame::Heartbeat(channel) => encode_heartbeat_frame(&mut buf, channel),
    }
}

fn encode_method_frame(buf: &mut BytesMut, channel: Channel, cm: ClassMethod, args: &MethodFrameArgs) {
    buf.put_u8(FRAME_METHOD);
    buf.put_u16(channel);

    let mut fr = BytesMut::with_capacity(4096);
    fr.put_u32(cm);

    match args {
        MethodFrameArgs::ConnectionStart(args) => encode_connection_start(&mut fr, args),
        MethodFrameArgs::ConnectionStartOk(args) => encode_connection_start_ok(&mut fr, args),
        MethodFrameArgs::ConnectionTune(args) => encode_connection_tune(&mut fr, args),
        MethodFrameArgs::ConnectionTuneOk(args) => encode_connection_tune_ok(&mut fr, args),
        MethodFrameArgs::ConnectionOpen(args) => encode_connection_open(&mut fr, args),
        MethodFrameArgs::ConnectionOpenOk => encode_short_string(&mut fr, ""),
        MethodFrameArgs::ConnectionClose(args) => encode_connection_close(&mut fr, args),
        MethodFrameArgs::ConnectionCloseOk => (),
        MethodFrameArgs::ChannelOpen => encode_short_string(&mut fr, ""),
        MethodFrameArgs::ChannelOpenOk => encode_long_string(&mut fr, ""),
        MethodFrameArgs::ChannelClose(args) => encode_channel_close(&mut fr, args),
        MethodFrameArgs::ChannelCloseOk => (),
        MethodFrameArgs::ExchangeDeclare(args) => encode_exchange_declare(&mut fr, args),
        MethodFrameArgs::ExchangeDeclareOk => (),
        MethodFrameArgs::QueueDeclare(args) => encode_queue_declare(&mut fr, args),
        MethodFrameArgs::QueueDeclareOk(args) => encode_queue_declare_ok(&mut fr, args),
        MethodFrameArgs::QueueBind(args) => encode_queue_bind(&mut fr, args),
        MethodFrameArgs::QueueBindOk => (),
        MethodFrameArgs::BasicConsume(args) => encode_basic_consume(&mut fr, args),
        MethodFrameArgs::BasicConsumeOk(args) => encode_short_string(&mut fr, &args.consumer_tag),
        MethodFrameArgs::BasicCancel(args) => encode_basic_cancel(&mut fr, args),
        MethodFrameArgs::BasicCancelOk(args) => encode_short_string(&mut fr, &args.consumer_tag),
        MethodFrameArgs::BasicPublish(args) => encode_basic_publish(&mut fr, args),
        MethodFrameArgs::BasicReturn(args) => encode_basic_return(&mut fr, args),
        MethodFrameArgs::BasicDeliver(args) => encode_basic_deliver(&mut fr, args),
        MethodFrameArgs::BasicAck(args) => {
            fr.put_u64(args.delivery_tag);
            fr.put_u8(args.multiple as u8);
        }
        MethodFrameArgs::BasicReject(args) => {
            fr.put_u64(args.delivery_tag);
            fr.put_u8(args.requeue as u8);
        }
    }

    buf.put_u32(fr.len() as u32);
    buf.put(fr);
    buf.put_u8(FRAME_END);
}

fn encode_connection_start(mut buf: &mut BytesMut, args: &ConnectionStartArgs) {
    buf.put_u8(args.version_major);
    buf.put_u8(args.version_minor);
    encode_field_table(&mut buf, args.properties.as_ref());
    encode_long_string(&mut buf, &args.mechanisms);
    encode_long_string(&mut buf, &args.locales);
}

fn encode_connection_start_ok(mut buf: &mut BytesMut, args: &ConnectionStartOkArgs) {
    encode_field_table(&mut buf, args.properties.as_ref());
    encode_short_string(&mut buf, &args.mechanism);
    buf.put_u32(args.response.len() as u32);
    buf.put(args.response.as_slice());
    encode_short_string(&mut buf, &args.locale);
}

fn encode_connection_tune(buf: &mut BytesMut, args: &ConnectionTuneArgs) {
    buf.put_u16(args.channel_max);
    buf.put_u32(args.frame_max);
    buf.put_u16(args.heartbeat);
}

fn encode_connection_tune_ok(buf: &mut BytesMut, args: &ConnectionTuneOkArgs) {
    buf.put_u16(args.channel_max);
    buf.put_u32(args.frame_max);
    buf.put_u16(args.heartbeat);
}

fn encode_connection_open(buf: &mut BytesMut, args: &ConnectionOpenArgs) {
    encode_short_string(buf, &args.virtual_host);
    encode_short_string(buf, "");
    buf.put_u8(args.insist as u8);
}

fn encode_connection_close(mut buf: &mut BytesMut, args: &ConnectionCloseArgs) {
    buf.put_u16(args.code);
    encode_short_string(&mut buf, &args.text);
    buf.put_u16(args.class_id);
    buf.put_u16(args.method_id);
}

fn encode_channel_close(mut buf: &mut BytesMut, args: &ChannelCloseArgs) {
    buf.put_u16(args.code);
    encode_short_string(&mut buf, &args.text);
    buf.put_u16(args.class_id);
    buf.put_u16(args.method_id);
}

fn encode_exchange_declare(mut buf: &mut BytesMut, args: &ExchangeDeclareArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.exchange_type);
    buf.put_u8(args.flags.bits());
    encode_field_table(&mut buf, args.args.as_ref());
}

fn encode_queue_declare(mut buf: &mut BytesMut, args: &QueueDeclareArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.name);
    buf.put_u8(args.flags.bits());
    encode_field_table(&mut buf, args.args.as_ref());
}

fn encode_queue_declare_ok(mut buf: &mut BytesMut, args: &QueueDeclareOkArgs) {
    encode_short_string(&mut buf, &args.name);
    buf.put_u32(args.message_count);
    buf.put_u32(args.consumer_count);
}

fn encode_queue_bind(mut buf: &mut BytesMut, args: &QueueBindArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.queue_name);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
    buf.put_u8(args.no_wait as u8);
    encode_field_table(&mut buf, args.args.as_ref());
}

fn encode_basic_consume(mut buf: &mut BytesMut, args: &BasicConsumeArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.queue);
    encode_short_string(&mut buf, &args.consumer_tag);
    buf.put_u8(args.flags.bits());
    encode_field_table(&mut buf, args.args.as_ref());
}

fn encode_basic_cancel(mut buf: &mut BytesMut, args: &BasicCancelArgs) {
    encode_short_string(&mut buf, &args.consumer_tag);
    buf.put_u8(args.no_wait as u8);
}

fn encode_basic_publish(mut buf: &mut BytesMut, args: &BasicPublishArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
    buf.put_u8(args.flags.bits());
}

fn encode_basic_return(mut buf: &mut BytesMut, args: &BasicReturnArgs) {
    buf.put_u16(args.reply_code);
    encode_short_string(&mut buf, &args.reply_text);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
}

fn encode_basic_deliver(mut buf: &mut BytesMut, args: &BasicDeliverArgs) {
    encode_short_string(&mut buf, &args.consumer_tag);
    buf.put_u64(args.delivery_tag);
    buf.put_u8(args.redelivered as u8);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
}

fn encode_content_header_frame(mut buf: &mut BytesMut, hf: &ContentHeaderFrame) {
    buf.put_u8(FRAME_CONTENT_HEADER);
    buf.put_u16(hf.channel);

    let mut fr = BytesMut::with_capacity(4096);
    fr.put_u16(hf.class_id);
    fr.put_u16(hf.weight);
    fr.put_u64(hf.body_size);
    fr.put_u16(hf.prop_flags.bits());

    if let Some(ref content_type) = hf.content_type {
        encode_short_string(&mut fr, content_type);
    }
    if let Some(ref content_encoding) = hf.content_encoding {
        encode_short_string(&mut fr, content_encoding);
    }
    if hf.headers.is_some() {
        encode_field_table(&mut fr, hf.headers.as_ref());
    }
    if let Some(delivery_mode) = hf.delivery_mode {
        fr.put_u8(delivery_mode);
    }
    if let Some(priority) = hf.priority {
        fr.put_u8(priority);
    }
    if let Some(ref correlation_id) = hf.correlation_id {
        encode_short_string(&mut fr, correlation_id);
    }
    if let Some(ref reply_to) = hf.reply_to {
        encode_short_string(&mut fr, reply_to);
    }
    if let Some(ref expiration) = hf.expiration {
        encode_short_string(&mut fr, expiration);
    }
    if let Some(ref message_id) = hf.message_id {
        encode_short_string(&mut fr, message_id);
    }
    if let Some(timestamp) = hf.timestamp {
        fr.put_u64(timestamp);
    }
    if let Some(ref message_type) = hf.message_type {
        encode_short_string(&mut fr, message_type);
    }
    if let Some(ref user_id) = hf.user_id {
        encode_short_string(&mut fr, user_id);
    }
    if let Some(ref app_id) = hf.app_id {
        encode_short_string(&mut fr, app_id);
    }
    if let Some(ref cluster_id) = hf.cluster_id {
        encode_short_string(&mut fr, cluster_id);
    }

    buf.put_u32(fr.len() as u32);
    buf.put(fr);
    buf.put_u8(FRAME_END);
}

fn encode_content_body_frame(buf: &mut BytesMut, bf: &ContentBodyFrame) {
    buf.put_u8(FRAME_CONTENT_BODY);
    buf.put_u16(bf.channel);
    buf.put_u32(bf.body.len() as u32);
    buf.put(bf.body.as_slice());
    buf.put_u8(FRAME_END);
}

fn encode_heartbeat_frame(buf: &mut BytesMut, channel: Channel) {
    buf.put_u8(FRAME_HEARTBEAT);
    buf.put_u16(channel);
    buf.put_u32(0);
    buf.put_u8(FRAME_END);
}

fn encode_short_string(buf: &mut BytesMut, s: &str) {
    buf.put_u8(s.len() as u8);
    buf.put(s.as_bytes());
}

fn encode_long_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put(s.as_bytes());
}

fn encode_field_table(buf: &mut BytesMut, ft: Option<&HashMap<String, AMQPFieldValue>>) {
    match ft {
        None => buf.put_u32(0),
        Some(t) => {
            let mut ft_buf = BytesMut::with_capacity(4096);

            for (name, value) in t {
                encode_short_string(&mut ft_buf, name);
                encode_field_value(&mut ft_buf, value);
            }

            buf.put_u32(ft_buf.len() as u32);
            buf.put(ft_buf);
        }
    }
}

fn encode_field_value(buf: &mut BytesMut, value: &AMQPFieldValue) {
    match value {
        AMQPFieldValue::Bool(v) => {
            buf.put_u8(b't');
            buf.put_u8(*v as u8);
        }
        AMQPFieldValue::LongString(v) => {
            buf.put_u8(b'S');
            encode_long_string(buf, v);
        }
        AMQPFieldValue::EmptyFieldTable => {
            buf.put_u8(b'F');
            buf.put_u32(0);
        }
        AMQPFieldValue::FieldTable(v) => {
            buf.put_u8(b'F');
            encode_field_table(buf, Some(v));
        }
    }
}
