use super::{AMQPFieldValue, AMQPFrame, FieldTable, MethodFrameArgs};

#[derive(Debug, Default)]
pub struct ConnectionStartArgs {
    pub version_major: u8,
    pub version_minor: u8,
    pub properties: Option<FieldTable>,
    pub mechanisms: String,
    pub locales: String,
}

#[derive(Debug, Default)]
pub struct ConnectionStartOkArgs {
    pub properties: Option<FieldTable>,
    pub mechanism: String,
    /// SASL response blob. Not a string: the AMQPLAIN table embeds raw
    /// length octets.
    pub response: Vec<u8>,
    pub locale: String,
}

#[derive(Debug, Default)]
pub struct ConnectionTuneArgs {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

#[derive(Debug, Default)]
pub struct ConnectionTuneOkArgs {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

#[derive(Debug, Default)]
pub struct ConnectionOpenArgs {
    pub virtual_host: String,
    pub insist: bool,
}

#[derive(Debug, Default)]
pub struct ConnectionCloseArgs {
    pub code: u16,
    pub text: String,
    pub class_id: u16,
    pub method_id: u16,
}

/// Encode the `AMQPLAIN` SASL response: a field table of `LOGIN` and
/// `PASSWORD` long strings, without the outer length prefix.
pub fn amqplain_response(username: &str, password: &str) -> Vec<u8> {
    let mut response = Vec::with_capacity(32 + username.len() + password.len());

    for (name, value) in [("LOGIN", username), ("PASSWORD", password)] {
        response.push(name.len() as u8);
        response.extend_from_slice(name.as_bytes());
        response.push(b'S');
        response.extend_from_slice(&(value.len() as u32).to_be_bytes());
        response.extend_from_slice(value.as_bytes());
    }

    response
}

impl ConnectionStartArgs {
    pub fn new() -> Self {
        Self {
            version_major: 0,
            version_minor: 9,
            properties: None,
            mechanisms: "PLAIN AMQPLAIN".into(),
            locales: "en_US".into(),
        }
    }

    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_START, MethodFrameArgs::ConnectionStart(self))
    }
}

impl ConnectionTuneArgs {
    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_TUNE, MethodFrameArgs::ConnectionTune(self))
    }
}

impl ConnectionStartOkArgs {
    /// Build a `Connection.StartOk` for `AMQPLAIN` authentication with the
    /// identifying client properties.
    pub fn amqplain(username: &str, password: &str) -> Self {
        let mut client_properties = FieldTable::new();

        client_properties.insert("platform".into(), AMQPFieldValue::LongString("Rust".into()));
        client_properties.insert("product".into(), AMQPFieldValue::LongString("coppermq".into()));
        client_properties.insert(
            "information".into(),
            AMQPFieldValue::LongString("https://github.com/coppermq/coppermq".into()),
        );
        client_properties.insert(
            "version".into(),
            AMQPFieldValue::LongString(env!("CARGO_PKG_VERSION").into()),
        );

        Self {
            properties: Some(client_properties),
            mechanism: "AMQPLAIN".into(),
            response: amqplain_response(username, password),
            locale: "en_US".into(),
        }
    }

    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_START_OK, MethodFrameArgs::ConnectionStartOk(self))
    }
}

impl ConnectionTuneOkArgs {
    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_TUNE_OK, MethodFrameArgs::ConnectionTuneOk(self))
    }
}

impl ConnectionOpenArgs {
    pub fn virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_string();
        self
    }

    pub fn insist(mut self, mode: bool) -> Self {
        self.insist = mode;
        self
    }

    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_OPEN, MethodFrameArgs::ConnectionOpen(self))
    }
}

impl ConnectionCloseArgs {
    pub fn new(code: u16, text: &str) -> Self {
        Self {
            code,
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_CLOSE, MethodFrameArgs::ConnectionClose(self))
    }
}

/// Echo the tune parameters the way a client replies: unlimited channels,
/// the frame size proposed by the server and no server side heartbeat.
pub fn connection_tune_ok(frame_max: u32) -> AMQPFrame {
    ConnectionTuneOkArgs {
        channel_max: 0,
        frame_max,
        heartbeat: 0,
    }
    .frame()
}

pub fn connection_open_ok() -> AMQPFrame {
    AMQPFrame::Method(0, super::CONNECTION_OPEN_OK, MethodFrameArgs::ConnectionOpenOk)
}

pub fn connection_close_ok() -> AMQPFrame {
    AMQPFrame::Method(0, super::CONNECTION_CLOSE_OK, MethodFrameArgs::ConnectionCloseOk)
}
