use std::sync::atomic::Ordering;

use spark_session::{PipelineMessage, WriteFuture};
use spark_session_tls::{
    DISABLE_ENCRYPTION_ONCE, ENCRYPTED_WRITE, TlsFilter, TlsFilterOptions, error::codes, is_control_write,
};

use crate::support::{DATA, HELLO, kinds, mask, pump, record, records, toy_pair};

fn client_options() -> TlsFilterOptions {
    TlsFilterOptions::client("toy.example")
}

/// 握手完成前提交的写请求按提交顺序缓存，握手完成后依次加密下发。
#[test]
fn pre_handshake_writes_are_released_in_order_after_handshake() {
    let pair = toy_pair(client_options(), TlsFilterOptions::server());
    let client = &pair.client.session;

    let futures: Vec<WriteFuture> = ["one", "two", "three"]
        .into_iter()
        .map(|text| client.write(text.as_bytes().to_vec()))
        .collect();
    assert!(futures.iter().all(|future| !future.is_done()), "握手完成前写请求不应完成");
    let handler = TlsFilter::session_handler(client).expect("tls handler");
    assert_eq!(handler.pending_handshake_writes(), 3);

    let frames = pump(client, &pair.server.session);
    assert_eq!(kinds(&frames, true), [HELLO, DATA, DATA, DATA]);
    assert_eq!(handler.pending_handshake_writes(), 0);

    let expected: Vec<Vec<u8>> = ["one", "two", "three"].iter().map(|text| text.as_bytes().to_vec()).collect();
    assert_eq!(pair.server.handler.received_bytes(), expected);
    assert_eq!(pair.client.handler.sent_bytes(), expected, "应用只应看到自己的明文");
    assert!(futures.iter().all(WriteFuture::is_written));

    let payloads: Vec<Vec<u8>> = frames
        .iter()
        .filter(|frame| frame.from_client)
        .flat_map(|frame| records(&frame.bytes))
        .filter(|(kind, _)| *kind == DATA)
        .map(|(_, payload)| payload)
        .collect();
    assert_eq!(payloads[0], mask(b"one"), "线上只应出现密文");
}

/// 加密后的写请求完成时，原始请求的完成句柄恰好完成一次。
#[test]
fn encrypted_write_completes_original_request_once() {
    let pair = toy_pair(client_options(), TlsFilterOptions::server());
    let client = &pair.client.session;
    pump(client, &pair.server.session);

    let future = client.write(b"hello".to_vec());
    let request = client.poll_write_request().expect("encrypted request");
    assert!(request.has_tag(ENCRYPTED_WRITE));
    assert!(request.future().same_as(&future));
    assert_eq!(
        request.message().as_bytes().map(|bytes| bytes.to_vec()),
        Some(record(DATA, &mask(b"hello")))
    );
    assert!(!future.is_done());

    client.complete_write(request);
    assert!(future.is_written());
    assert_eq!(pair.client.handler.sent_bytes(), [b"hello".to_vec()]);
    assert!(!future.complete(spark_session::WriteStatus::Written), "完成句柄只能完成一次");
}

/// 一次性标记只绕过紧随其后的一次写入。
#[test]
fn disable_encryption_once_bypasses_a_single_write() {
    let pair = toy_pair(client_options(), TlsFilterOptions::server());
    let client = &pair.client.session;
    pump(client, &pair.server.session);

    client.attributes().insert(DISABLE_ENCRYPTION_ONCE, ());
    client.write(b"raw".to_vec());
    client.write(b"next".to_vec());

    let raw = client.poll_write_request().expect("raw request");
    assert_eq!(raw.message().as_bytes().map(|bytes| bytes.to_vec()), Some(b"raw".to_vec()));
    assert!(!raw.has_tag(ENCRYPTED_WRITE));
    let next = client.poll_write_request().expect("encrypted request");
    assert!(next.has_tag(ENCRYPTED_WRITE));

    client.complete_write(raw);
    client.complete_write(next);
    assert_eq!(pair.client.handler.sent_bytes(), [b"raw".to_vec(), b"next".to_vec()]);
}

/// 应用在 `message_received` 中同步写回不会自锁，且回写内容被加密。
#[test]
fn echo_from_message_received_does_not_deadlock() {
    let pair = toy_pair(client_options(), TlsFilterOptions::server());
    pair.server.handler.echo.store(true, Ordering::SeqCst);
    pump(&pair.client.session, &pair.server.session);

    pair.client.session.write(b"ping".to_vec());
    let frames = pump(&pair.client.session, &pair.server.session);
    assert_eq!(kinds(&frames, false), [DATA]);
    assert_eq!(pair.client.handler.received_bytes(), [b"ping".to_vec()]);
    assert_eq!(pair.server.handler.sent_bytes(), [b"ping".to_vec()]);
}

/// 握手完成后只接受字节缓冲，其余消息以非法状态失败。
#[test]
fn non_buffer_write_is_rejected_after_handshake() {
    let pair = toy_pair(client_options(), TlsFilterOptions::server());
    let client = &pair.client.session;
    pump(client, &pair.server.session);

    let future = client.write(PipelineMessage::from_user(42_u32));
    assert_eq!(future.failure().map(|error| error.code()), Some(codes::ILLEGAL_STATE));
    assert_eq!(pair.client.handler.exception_codes(), [codes::ILLEGAL_STATE]);
    assert_eq!(client.pending_writes(), 0);
}

/// 关闭自动握手时，写请求一直缓存到显式调用 `start_tls`。
#[test]
fn manual_start_buffers_writes_until_start_tls() {
    let pair = toy_pair(client_options().with_auto_start(false), TlsFilterOptions::server());
    let client = &pair.client.session;

    client.write(b"queued".to_vec());
    assert_eq!(client.pending_writes(), 0, "未握手前不应有任何线上写入");
    assert!(pump(client, &pair.server.session).is_empty());

    assert!(pair.client_filter.start_tls(client).expect("start tls"));
    assert!(!pair.client_filter.start_tls(client).expect("start tls again"), "重复启动不应再次握手");

    let frames = pump(client, &pair.server.session);
    assert_eq!(kinds(&frames, true), [HELLO, DATA]);
    assert_eq!(pair.server.handler.received_bytes(), [b"queued".to_vec()]);
    assert_eq!(pair.client.handler.sent_bytes(), [b"queued".to_vec()]);
}

/// 控制写（握手、`close_notify`）不会以 `message_sent` 的形式出现。
#[test]
fn control_writes_are_tagged() {
    let pair = toy_pair(client_options(), TlsFilterOptions::server());
    let hello = pair.client.session.poll_write_request().expect("hello request");
    assert!(is_control_write(&hello));
    pair.client.session.complete_write(hello);
    assert!(pair.client.handler.sent_bytes().is_empty());
}

/// 指定目标的写请求被加密后仍保留目标地址。
#[test]
fn destination_survives_encryption() {
    let pair = toy_pair(client_options(), TlsFilterOptions::server());
    let client = &pair.client.session;
    pump(client, &pair.server.session);

    let target: std::net::SocketAddr = "203.0.113.9:5061".parse().expect("addr");
    let future = client.write_to(b"routed".to_vec(), target);
    let request = client.poll_write_request().expect("encrypted request");
    assert!(request.has_tag(ENCRYPTED_WRITE));
    assert_eq!(request.destination(), Some(target));

    client.complete_write(request);
    assert!(future.is_written());
    assert_eq!(pair.client.handler.sent_bytes(), [b"routed".to_vec()]);
}
