#![cfg(feature = "server")]

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::{BufMut, Bytes, BytesMut};
use hybi_driver::{CloseCode, Config, Data, Error, Event, ServerBuilder};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

const REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Protocol: chat\r\nSec-WebSocket-Version: 13\r\n\r\n";

const MASK: [u8; 4] = [1, 2, 3, 4];

fn encode_frame(opcode: u8, payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::new();

    dst.put_u8(0x80 | opcode);
    dst.put_u8(0x80 | payload.len() as u8);
    dst.extend_from_slice(&MASK);
    dst.extend(
        payload
            .iter()
            .enumerate()
            .map(|(index, byte)| byte ^ MASK[index % 4]),
    );

    dst.freeze()
}

/// Reads exactly `length` bytes.
async fn read_exact(stream: &mut (impl AsyncReadExt + Unpin), length: usize) -> Vec<u8> {
    let mut buf = vec![0; length];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Reads everything up to and including the empty line ending the response
/// headers.
async fn read_response(stream: &mut (impl AsyncReadExt + Unpin)) -> String {
    let mut response = Vec::new();

    while !response.ends_with(b"\r\n\r\n") {
        response.push(stream.read_u8().await.unwrap());
    }

    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn echoes_and_closes() {
    let (server_side, mut client) = duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let builder = ServerBuilder::new().config(Config::default().protocols(["chat"]));
        let mut connection = builder.accept(server_side).await.unwrap();
        assert_eq!(connection.driver().protocol(), Some("chat"));

        let mut events = Vec::new();
        while let Some(event) = connection.next().await {
            let event = event.unwrap();
            if let Event::Message(Data::Text(text)) = &event {
                connection.text(text.clone()).await.unwrap();
            }
            events.push(event);
        }

        events
    });

    client.write_all(REQUEST).await.unwrap();
    let response = read_response(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(response.contains("Sec-WebSocket-Protocol: chat\r\n"));

    client.write_all(&encode_frame(0x1, b"echo")).await.unwrap();
    assert_eq!(read_exact(&mut client, 6).await, b"\x81\x04echo");

    client
        .write_all(&encode_frame(0x8, b"\x03\xe8bye"))
        .await
        .unwrap();
    assert_eq!(read_exact(&mut client, 7).await, b"\x88\x05\x03\xe8bye");

    let events = server.await.unwrap();
    assert!(matches!(events[0], Event::Open));
    assert!(matches!(&events[1], Event::Message(Data::Text(text)) if text == "echo"));
    assert!(
        matches!(&events[2], Event::Close(close) if close.code == CloseCode::NORMAL_CLOSURE && close.reason == "bye")
    );
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn frames_pipelined_with_request_are_parsed() {
    let (server_side, mut client) = duplex(64 * 1024);

    let mut input = REQUEST.to_vec();
    input.extend_from_slice(&encode_frame(0x2, &[1, 2, 3]));
    client.write_all(&input).await.unwrap();

    let mut connection = ServerBuilder::new().accept(server_side).await.unwrap();

    assert!(matches!(connection.next().await, Some(Ok(Event::Open))));
    assert!(matches!(
        connection.next().await,
        Some(Ok(Event::Message(Data::Binary(data)))) if data[..] == [1, 2, 3]
    ));
}

#[tokio::test]
async fn rejects_invalid_request() {
    let (server_side, mut client) = duplex(64 * 1024);

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let result = ServerBuilder::new().accept(server_side).await;
    assert!(matches!(result, Err(Error::Upgrade(_))));

    assert_eq!(
        read_response(&mut client).await,
        "HTTP/1.1 400 Bad Request\r\n\r\n"
    );
}

#[tokio::test]
async fn eof_closes_abnormally() {
    let (server_side, mut client) = duplex(64 * 1024);
    client.write_all(REQUEST).await.unwrap();

    let mut connection = ServerBuilder::new().accept(server_side).await.unwrap();
    drop(client);

    assert!(matches!(connection.next().await, Some(Ok(Event::Open))));
    assert!(matches!(
        connection.next().await,
        Some(Ok(Event::Close(close))) if close.code == CloseCode::ABNORMAL_CLOSURE
    ));
    assert!(connection.next().await.is_none());
}

#[tokio::test]
async fn protocol_error_is_reported() {
    let (server_side, mut client) = duplex(64 * 1024);
    client.write_all(REQUEST).await.unwrap();
    let mut connection = ServerBuilder::new().accept(server_side).await.unwrap();
    let _response = read_response(&mut client).await;

    // Unmasked text frame
    client.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

    assert!(matches!(connection.next().await, Some(Ok(Event::Open))));
    assert!(matches!(connection.next().await, Some(Ok(Event::Error(_)))));
    assert!(matches!(
        connection.next().await,
        Some(Ok(Event::Close(close))) if close.code == CloseCode::UNSUPPORTED_DATA
    ));

    let close = read_exact(&mut client, 4).await;
    assert_eq!(&close[..4], &[0x88, 0x31, 0x03, 0xeb]);
    assert!(matches!(
        connection.text("too late").await,
        Err(Error::AlreadyClosed)
    ));
}

#[tokio::test]
async fn ping_callback_runs_on_pong() {
    let (server_side, mut client) = duplex(64 * 1024);
    client.write_all(REQUEST).await.unwrap();
    let mut connection = ServerBuilder::new().accept(server_side).await.unwrap();
    let _response = read_response(&mut client).await;

    let ponged = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ponged);
    connection
        .ping_with("abc", move || flag.store(true, Ordering::SeqCst))
        .await
        .unwrap();
    assert_eq!(read_exact(&mut client, 5).await, b"\x89\x03abc");

    client.write_all(&encode_frame(0xa, b"abc")).await.unwrap();
    client
        .write_all(&encode_frame(0x8, b"\x03\xe8"))
        .await
        .unwrap();

    assert!(matches!(connection.next().await, Some(Ok(Event::Open))));
    assert!(matches!(connection.next().await, Some(Ok(Event::Close(_)))));
    assert!(ponged.load(Ordering::SeqCst));
}
