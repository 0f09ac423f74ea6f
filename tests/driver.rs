use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytes::{BufMut, Bytes, BytesMut};
use hybi_driver::{
    CloseCode, CloseEvent, Config, Data, Driver, Error, Handler, ProtocolError, ReadyState,
    UpgradeRequest,
};

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

const TEXT: u8 = 0x1;
const BINARY: u8 = 0x2;
const CONTINUATION: u8 = 0x0;
const CLOSE: u8 = 0x8;
const PING: u8 = 0x9;
const PONG: u8 = 0xa;
const FIN: u8 = 0x80;
const RSV1: u8 = 0x40;

#[derive(Debug, Default)]
struct Recorder {
    written: Vec<Bytes>,
    opened: usize,
    messages: Vec<Data>,
    errors: Vec<String>,
    closes: Vec<CloseEvent>,
}

impl Handler for Recorder {
    fn write(&mut self, bytes: Bytes) {
        self.written.push(bytes);
    }

    fn on_open(&mut self) {
        self.opened += 1;
    }

    fn on_message(&mut self, data: Data) {
        self.messages.push(data);
    }

    fn on_error(&mut self, error: &ProtocolError) {
        self.errors.push(error.to_string());
    }

    fn on_close(&mut self, event: CloseEvent) {
        self.closes.push(event);
    }
}

/// Encodes a frame the way a client would, masked with [`MASK`].
fn client_frame(first_byte: u8, payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::new();
    dst.put_u8(first_byte);

    if payload.len() <= 125 {
        dst.put_u8(0x80 | payload.len() as u8);
    } else if let Ok(length) = u16::try_from(payload.len()) {
        dst.put_u8(0x80 | 126);
        dst.put_u16(length);
    } else {
        dst.put_u8(0x80 | 127);
        dst.put_u64(payload.len() as u64);
    }

    dst.extend_from_slice(&MASK);
    dst.extend(
        payload
            .iter()
            .enumerate()
            .map(|(index, byte)| byte ^ MASK[index % 4]),
    );

    dst.freeze()
}

fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    payload
}

fn open_with(config: Config, request: &UpgradeRequest) -> Driver<Recorder> {
    let mut driver = Driver::new(request, config, Recorder::default());
    driver.start().unwrap();
    driver.handler_mut().written.clear();

    driver
}

fn open(config: Config) -> Driver<Recorder> {
    open_with(config, &UpgradeRequest::new(KEY))
}

/// Asserts that the connection failed with `code`, answering with a close
/// frame carrying that code.
fn assert_failed(driver: &Driver<Recorder>, code: u16) {
    let handler = driver.handler();

    assert_eq!(driver.ready_state(), ReadyState::Closed);
    assert_eq!(handler.errors.len(), 1, "{handler:?}");
    assert_eq!(handler.closes.len(), 1);
    assert_eq!(u16::from(handler.closes[0].code), code);

    let close = handler.written.last().expect("no close frame written");
    assert_eq!(close[0], FIN | CLOSE);
    assert_eq!(&close[2..4], &code.to_be_bytes());
}

#[test]
fn handshake_response() {
    let request = UpgradeRequest::new(KEY).protocol("soap, chat, superchat");
    let config = Config::default().protocol_list("superchat, chat");
    let mut driver = Driver::new(&request, config, Recorder::default());

    assert_eq!(driver.ready_state(), ReadyState::Connecting);
    assert_eq!(driver.key(), KEY);
    assert_eq!(driver.version(), "hybi-13");
    assert_eq!(driver.protocol(), Some("chat"));

    driver.start().unwrap();

    assert_eq!(driver.ready_state(), ReadyState::Open);
    assert_eq!(driver.handler().opened, 1);
    assert_eq!(
        driver.handler().written,
        [Bytes::from_static(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\nSec-WebSocket-Protocol: chat\r\n\r\n"
        )]
    );
    assert!(matches!(driver.start(), Err(Error::AlreadyStarted)));
}

#[test]
fn no_matching_protocol_is_not_an_error() {
    let request = UpgradeRequest::new(KEY).protocol("soap");
    let driver = open_with(Config::default().protocols(["chat"]), &request);

    assert_eq!(driver.protocol(), None);
    assert_eq!(driver.ready_state(), ReadyState::Open);
}

#[test]
fn fragmented_message_reassembles() {
    let mut driver = open(Config::default());

    driver.parse(&client_frame(TEXT, b"Hel"));
    driver.parse(&client_frame(FIN | PING, b"keepalive"));
    driver.parse(&client_frame(CONTINUATION, b"lo"));
    driver.parse(&client_frame(CONTINUATION, b""));
    assert!(driver.handler().messages.is_empty());
    driver.parse(&client_frame(FIN | CONTINUATION, b", world"));

    assert_eq!(
        driver.handler().messages,
        [Data::Text(String::from("Hello, world"))]
    );
    // The ping in between was answered with a matching pong
    assert_eq!(
        driver.handler().written,
        [Bytes::from_static(b"\x8a\x09keepalive")]
    );
}

#[test]
fn parses_byte_by_byte() {
    let mut driver = open(Config::default());
    let payload: Vec<u8> = std::iter::repeat_with(|| fastrand::u8(..))
        .take(70_000)
        .collect();

    let mut input = client_frame(FIN | BINARY, &payload).to_vec();
    input.extend_from_slice(&client_frame(FIN | TEXT, b"done"));

    for chunk in input.chunks(7) {
        driver.parse(chunk);
    }

    assert_eq!(
        driver.handler().messages,
        [
            Data::Binary(Bytes::from(payload)),
            Data::Text(String::from("done"))
        ]
    );
}

#[test]
fn remote_close_is_echoed() {
    let mut driver = open(Config::default());

    driver.parse(&client_frame(FIN | CLOSE, &close_payload(1000, "bye")));

    let handler = driver.handler();
    assert_eq!(driver.ready_state(), ReadyState::Closed);
    assert_eq!(handler.written, [Bytes::from_static(b"\x88\x05\x03\xe8bye")]);
    assert!(handler.errors.is_empty());
    assert_eq!(
        handler.closes,
        [CloseEvent {
            code: CloseCode::NORMAL_CLOSURE,
            reason: String::from("bye")
        }]
    );
}

#[test]
fn empty_close_means_normal_closure() {
    let mut driver = open(Config::default());

    driver.parse(&client_frame(FIN | CLOSE, b""));

    assert_eq!(driver.handler().closes[0].code, CloseCode::NORMAL_CLOSURE);
    assert_eq!(
        driver.handler().written,
        [Bytes::from_static(b"\x88\x02\x03\xe8")]
    );
}

#[test]
fn malformed_close_payloads_become_protocol_errors() {
    for payload in [
        vec![0x03],
        close_payload(1500, ""),
        close_payload(1006, ""),
        close_payload(5000, "later"),
        vec![0x03, 0xe8, 0xff, 0xfe],
    ] {
        let mut driver = open(Config::default());
        driver.parse(&client_frame(FIN | CLOSE, &payload));

        assert_eq!(
            driver.handler().closes[0].code,
            CloseCode::PROTOCOL_ERROR,
            "{payload:?}"
        );
        assert!(driver.handler().errors.is_empty());
    }
}

#[test]
fn private_close_codes_are_accepted() {
    let mut driver = open(Config::default());

    driver.parse(&client_frame(FIN | CLOSE, &close_payload(4000, "app")));

    assert_eq!(u16::from(driver.handler().closes[0].code), 4000);
}

#[test]
fn local_close_waits_for_peer() {
    let mut driver = open(Config::default());

    driver.close("done", Some(CloseCode::GOING_AWAY)).unwrap();

    assert_eq!(driver.ready_state(), ReadyState::Closing);
    assert_eq!(
        driver.handler().written,
        [Bytes::from_static(b"\x88\x06\x03\xe9done")]
    );
    assert!(driver.handler().closes.is_empty());
    assert!(matches!(driver.text("late"), Err(Error::AlreadyClosed)));
    assert!(matches!(driver.close("", None), Err(Error::AlreadyClosed)));

    // Messages still in flight are delivered
    driver.parse(&client_frame(FIN | TEXT, b"in flight"));
    driver.parse(&client_frame(FIN | CLOSE, &close_payload(1001, "")));

    assert_eq!(driver.ready_state(), ReadyState::Closed);
    assert_eq!(driver.handler().messages.len(), 1);
    // No second close frame is sent
    assert_eq!(driver.handler().written.len(), 1);
    assert_eq!(driver.handler().closes[0].code, CloseCode::GOING_AWAY);
}

#[test]
fn sends_while_connecting_are_queued() {
    let mut driver = Driver::new(
        &UpgradeRequest::new(KEY),
        Config::default(),
        Recorder::default(),
    );

    driver.text("first").unwrap();
    driver.binary(vec![2]).unwrap();
    driver.ping("third").unwrap();
    assert!(driver.handler().written.is_empty());

    driver.start().unwrap();
    driver.text("fourth").unwrap();

    let written = &driver.handler().written;
    assert!(written[0].starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
    assert_eq!(
        &written[1..],
        [
            Bytes::from_static(b"\x81\x05first"),
            Bytes::from_static(b"\x82\x01\x02"),
            Bytes::from_static(b"\x89\x05third"),
            Bytes::from_static(b"\x81\x06fourth"),
        ]
    );
}

#[test]
fn input_before_start_is_buffered() {
    let mut driver = Driver::new(
        &UpgradeRequest::new(KEY),
        Config::default(),
        Recorder::default(),
    );

    driver.parse(&client_frame(FIN | TEXT, b"early"));
    assert!(driver.handler().messages.is_empty());

    driver.start().unwrap();

    assert_eq!(driver.handler().opened, 1);
    assert_eq!(
        driver.handler().messages,
        [Data::Text(String::from("early"))]
    );
}

#[test]
fn ping_callback_runs_on_matching_pong() {
    let mut driver = open(Config::default());
    let pongs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&pongs);
    driver
        .ping_with("abc", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(driver.handler().written, [Bytes::from_static(b"\x89\x03abc")]);

    driver.parse(&client_frame(FIN | PONG, b"abd"));
    assert_eq!(pongs.load(Ordering::SeqCst), 0);

    driver.parse(&client_frame(FIN | PONG, b"abc"));
    assert_eq!(pongs.load(Ordering::SeqCst), 1);

    driver.parse(&client_frame(FIN | PONG, b"abc"));
    assert_eq!(pongs.load(Ordering::SeqCst), 1);
}

#[test]
fn later_ping_callback_replaces_earlier_one() {
    let mut driver = open(Config::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = Arc::clone(&calls);
    driver
        .ping_with("same", move || {
            first.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let second = Arc::clone(&calls);
    driver
        .ping_with("same", move || {
            second.fetch_add(10, Ordering::SeqCst);
        })
        .unwrap();

    driver.parse(&client_frame(FIN | PONG, b"same"));

    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[test]
fn message_too_big() {
    let mut driver = open(Config::default().max_length(Some(10)));

    driver.parse(&client_frame(FIN | BINARY, &[0; 11]));

    assert_failed(&driver, 1009);
    assert!(driver.handler().messages.is_empty());
}

#[test]
fn fragmented_message_too_big() {
    let mut driver = open(Config::default().max_length(Some(10)));

    driver.parse(&client_frame(BINARY, &[0; 6]));
    // Control frames do not count towards the message
    driver.parse(&client_frame(FIN | PING, &[0; 6]));
    assert_eq!(driver.ready_state(), ReadyState::Open);

    driver.parse(&client_frame(FIN | CONTINUATION, &[0; 6]));

    assert_failed(&driver, 1009);
}

#[test]
fn declared_length_is_checked_before_payload_arrives() {
    let mut driver = open(Config::default().max_length(Some(1024)));

    // Only the header of a frame declaring 2^40 bytes
    driver.parse(&[FIN | BINARY, 0x80 | 127, 0, 0, 1, 0, 0, 0, 0, 0]);

    assert_failed(&driver, 1009);
}

#[test]
fn unmasked_frames_are_rejected() {
    let mut driver = open(Config::default());

    driver.parse(&[FIN | TEXT, 0x02, b'h', b'i']);

    assert_failed(&driver, 1003);
}

#[test]
fn unmasked_frames_can_be_allowed() {
    let mut driver = open(Config::default().require_masking(false));

    driver.parse(&[FIN | TEXT, 0x02, b'h', b'i']);

    assert_eq!(driver.handler().messages, [Data::Text(String::from("hi"))]);
}

#[test]
fn invalid_utf8_fails() {
    let mut driver = open(Config::default());

    driver.parse(&client_frame(TEXT, &[0xce, 0xba, 0xe1]));
    driver.parse(&client_frame(FIN | CONTINUATION, &[0xbd, 0xb9, 0xcf, 0x83, 0xff]));

    assert_failed(&driver, 1007);
}

#[test]
fn utf8_may_be_split_across_frames() {
    let mut driver = open(Config::default());

    // [240, 159, 152, 132] is a grinning face
    driver.parse(&client_frame(TEXT, &[b'a', 240, 159]));
    driver.parse(&client_frame(FIN | CONTINUATION, &[152, 132]));

    assert_eq!(
        driver.handler().messages,
        [Data::Text(String::from("a\u{1f604}"))]
    );
}

#[test]
fn protocol_violations_fail_with_1002() {
    let cases: [(&str, Vec<u8>); 6] = [
        (
            "reserved bit",
            client_frame(FIN | RSV1 | TEXT, b"x").to_vec(),
        ),
        ("unknown opcode", client_frame(FIN | 0x3, b"x").to_vec()),
        ("fragmented ping", client_frame(PING, b"x").to_vec()),
        (
            "interleaved message",
            [client_frame(TEXT, b"a"), client_frame(FIN | TEXT, b"b")].concat(),
        ),
        (
            "unexpected continuation",
            client_frame(FIN | CONTINUATION, b"x").to_vec(),
        ),
        (
            "long control frame",
            client_frame(FIN | PING, &[0; 126]).to_vec(),
        ),
    ];

    for (name, input) in cases {
        let mut driver = open(Config::default());
        driver.parse(&input);

        assert_eq!(driver.ready_state(), ReadyState::Closed, "{name}");
        assert_failed(&driver, 1002);
    }
}

#[test]
fn input_after_failure_is_ignored() {
    let mut driver = open(Config::default());

    driver.parse(
        &[
            client_frame(FIN | 0x3, b"x"),
            client_frame(FIN | TEXT, b"ignored"),
        ]
        .concat(),
    );
    driver.parse(&client_frame(FIN | TEXT, b"ignored"));

    assert!(driver.handler().messages.is_empty());
    assert_eq!(driver.handler().closes.len(), 1);
}

#[test]
fn transport_loss_closes_abnormally() {
    let mut driver = open(Config::default());
    driver.parse(&client_frame(TEXT, b"partial"));

    driver.force_close();

    assert_eq!(driver.ready_state(), ReadyState::Closed);
    assert!(driver.handler().written.is_empty());
    assert!(driver.handler().messages.is_empty());
    assert_eq!(
        driver.handler().closes[0].code,
        CloseCode::ABNORMAL_CLOSURE
    );
    assert!(matches!(driver.ping(""), Err(Error::AlreadyClosed)));
}

#[cfg(feature = "permessage-deflate")]
mod deflate {
    use flate2::{Decompress, FlushDecompress};
    use hybi_driver::extensions::{permessage_deflate, ExtensionConfiguration, Offer};

    use super::*;

    fn deflate_config() -> Config {
        Config::default().extensions(
            ExtensionConfiguration::default()
                .permessage_deflate(permessage_deflate::Configuration::default()),
        )
    }

    fn inflate(payload: &[u8]) -> Vec<u8> {
        let mut input = payload.to_vec();
        input.extend_from_slice(&[0x00, 0x00, 0xff, 0xff]);

        let mut output = Vec::with_capacity(1024);
        Decompress::new(false)
            .decompress_vec(&input, &mut output, FlushDecompress::Sync)
            .unwrap();
        output
    }

    #[test]
    fn negotiates_and_inflates() {
        let request = UpgradeRequest::new(KEY)
            .extensions("x-unknown, permessage-deflate; client_max_window_bits");
        let mut driver = Driver::new(&request, deflate_config(), Recorder::default());
        driver.start().unwrap();

        let response = &driver.handler().written[0];
        assert!(response
            .windows(46)
            .any(|header| header == b"Sec-WebSocket-Extensions: permessage-deflate\r\n"));
        assert_eq!(driver.extensions().collect::<Vec<_>>(), ["permessage-deflate"]);

        // "Hello" compressed, as in RFC7692 section 7.2.3.1
        driver.parse(&client_frame(
            FIN | RSV1 | TEXT,
            &[0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00],
        ));
        // Uncompressed messages pass through
        driver.parse(&client_frame(FIN | TEXT, b"plain"));

        assert_eq!(
            driver.handler().messages,
            [
                Data::Text(String::from("Hello")),
                Data::Text(String::from("plain"))
            ]
        );
    }

    #[test]
    fn compresses_outgoing_messages() {
        let request = UpgradeRequest::new(KEY).extensions("permessage-deflate");
        let mut driver = open_with(deflate_config(), &request);

        driver.text("Hello").unwrap();
        driver.ping("not compressed").unwrap();

        let written = &driver.handler().written;
        assert_eq!(written[0][0], FIN | RSV1 | TEXT);
        let length = usize::from(written[0][1]);
        assert_eq!(inflate(&written[0][2..2 + length]), b"Hello");
        assert_eq!(&written[1][..], b"\x89\x0enot compressed");
    }

    #[test]
    fn offer_can_be_added_before_start() {
        let request = UpgradeRequest::new(KEY).extensions("permessage-deflate");
        let mut driver = Driver::new(&request, Config::default(), Recorder::default());

        driver
            .add_extension(Offer::PerMessageDeflate(
                permessage_deflate::Configuration::default(),
            ))
            .unwrap();
        driver.start().unwrap();

        assert_eq!(driver.extensions().count(), 1);
        assert!(matches!(
            driver.add_extension(Offer::PerMessageDeflate(
                permessage_deflate::Configuration::default()
            )),
            Err(Error::AlreadyStarted)
        ));
    }

    #[test]
    fn not_negotiated_without_offer() {
        let mut driver = Driver::new(
            &UpgradeRequest::new(KEY).extensions("  "),
            deflate_config(),
            Recorder::default(),
        );
        driver.start().unwrap();

        assert_eq!(driver.extensions().count(), 0);
        assert!(!driver.handler().written[0]
            .windows(24)
            .any(|header| header == b"Sec-WebSocket-Extensions"));
    }

    #[test]
    fn invalid_offer_fails_handshake() {
        let request = UpgradeRequest::new(KEY).extensions("permessage-deflate; bogus");
        let mut driver = Driver::new(&request, deflate_config(), Recorder::default());

        assert!(matches!(
            driver.start(),
            Err(Error::Protocol(ProtocolError::Negotiation(_)))
        ));

        let handler = driver.handler();
        assert_eq!(driver.ready_state(), ReadyState::Closed);
        assert!(handler.written.is_empty());
        assert_eq!(handler.opened, 0);
        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.closes[0].code, CloseCode::PROTOCOL_ERROR);
    }

    #[test]
    fn reserved_bit_on_control_frame_fails() {
        let request = UpgradeRequest::new(KEY).extensions("permessage-deflate");
        let mut driver = open_with(deflate_config(), &request);

        driver.parse(&client_frame(FIN | RSV1 | PING, b""));

        assert_failed(&driver, 1002);
    }

    #[test]
    fn reserved_bit_on_continuation_frame_fails() {
        let request = UpgradeRequest::new(KEY).extensions("permessage-deflate");
        let mut driver = open_with(deflate_config(), &request);

        driver.parse(&client_frame(TEXT, b"ab"));
        driver.parse(&client_frame(FIN | RSV1 | CONTINUATION, b"cd"));

        assert!(driver.handler().messages.is_empty());
        assert_failed(&driver, 1002);
    }

    #[test]
    fn corrupt_compressed_data_fails_with_1010() {
        let request = UpgradeRequest::new(KEY).extensions("permessage-deflate");
        let mut driver = open_with(deflate_config(), &request);

        driver.parse(&client_frame(FIN | RSV1 | BINARY, &[0xff; 8]));

        assert_failed(&driver, 1010);
    }

    #[test]
    fn inflated_size_is_limited() {
        let request = UpgradeRequest::new(KEY).extensions("permessage-deflate");
        let mut sender = open_with(deflate_config(), &request);
        sender.binary(vec![0; 50_000]).unwrap();
        let compressed = sender.handler().written[0].clone();
        // Strip the server frame header and send it back as a client frame
        let payload = &compressed[2 + usize::from(compressed[1] == 126) * 2..];

        let mut driver = open_with(deflate_config().max_length(Some(1000)), &request);
        driver.parse(&client_frame(FIN | RSV1 | BINARY, payload));

        assert_failed(&driver, 1009);
    }
}
