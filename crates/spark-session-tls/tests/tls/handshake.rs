use std::sync::{Arc, atomic::Ordering};

use spark_session::{CoreError, PipelineMessage};
use spark_session_tls::{
    DISABLE_ENCRYPTION_ONCE, TlsError, TlsFailureClass, TlsFilter, TlsFilterOptions, TlsNotification,
    error::codes,
};
use tracing_test::traced_test;

use crate::support::{
    ACK, BAD, DATA, HELLO, RENEG, ToyFactory, deliver, drain_wire, endpoint, kinds, pump, record, records,
    toy_pair, toy_pair_with,
};

fn client_options() -> TlsFilterOptions {
    TlsFilterOptions::client("toy.example").with_notification(true)
}

fn server_options() -> TlsFilterOptions {
    TlsFilterOptions::server().with_notification(true)
}

/// 完整握手：客户端 HELLO，服务端执行委托任务后 ACK，双方进入加密状态。
#[test]
fn toy_handshake_secures_both_sides() {
    let pair = toy_pair(client_options(), server_options());
    assert!(TlsFilter::is_tls_started(&pair.client.session));
    assert!(!TlsFilter::is_secured(&pair.client.session), "握手完成前不应视为已加密");

    let frames = pump(&pair.client.session, &pair.server.session);
    assert_eq!(kinds(&frames, true), [HELLO]);
    assert_eq!(kinds(&frames, false), [ACK]);

    assert!(TlsFilter::is_secured(&pair.client.session));
    assert!(TlsFilter::is_secured(&pair.server.session));
    assert_eq!(pair.factory.tasks_run.load(Ordering::SeqCst), 1, "服务端的委托任务应同步执行一次");
    assert_eq!(
        TlsFilter::negotiated_protocol(&pair.client.session).as_deref(),
        Some(&b"toy/1"[..])
    );
    assert_eq!(pair.client.handler.notifications(), [TlsNotification::SessionSecured]);
    assert_eq!(pair.server.handler.notifications(), [TlsNotification::SessionSecured]);
    assert!(pair.client.handler.sent_bytes().is_empty(), "握手报文不应产生 message_sent");
    assert!(pair.server.handler.sent_bytes().is_empty(), "握手报文不应产生 message_sent");

    let requests = pair.factory.requests.lock().expect("requests lock").clone();
    assert!(
        requests
            .iter()
            .any(|(client, name, peer)| *client && name.as_deref() == Some("toy.example") && peer.is_some()),
        "客户端引擎应收到 SNI 与对端地址: {requests:?}"
    );
}

/// 一条链上只允许一个 TLS 过滤器，失败的插入不影响已有的过滤器。
#[test]
fn second_tls_filter_is_rejected() {
    let pair = toy_pair(client_options(), server_options());
    let chain = pair.client.session.filter_chain();

    let error = chain
        .add_last("tls-again", Arc::new(TlsFilter::new(pair.factory.clone())))
        .expect_err("second tls filter");
    assert_eq!(
        error.lifecycle_source().map(CoreError::code),
        Some(codes::SINGLE_INSTANCE_VIOLATION)
    );
    let names: Vec<String> = chain.get_all().iter().map(|entry| entry.name().to_owned()).collect();
    assert_eq!(names, ["tls"]);

    pump(&pair.client.session, &pair.server.session);
    assert!(TlsFilter::is_secured(&pair.client.session), "原有过滤器应继续工作");
}

/// 重协商之后“已加密”通知仍只出现一次，数据继续正常收发。
#[test]
fn secured_notification_fires_once_across_renegotiation() {
    let pair = toy_pair(client_options(), server_options());
    pump(&pair.client.session, &pair.server.session);

    let client = &pair.client.session;
    client.attributes().insert(DISABLE_ENCRYPTION_ONCE, ());
    client.write(record(RENEG, &[]));
    assert!(!client.attributes().contains(DISABLE_ENCRYPTION_ONCE), "一次性标记应被消费");

    let frames = pump(client, &pair.server.session);
    assert_eq!(kinds(&frames, true), [RENEG]);
    assert_eq!(kinds(&frames, false), [ACK]);
    assert!(TlsFilter::is_secured(client));
    assert!(TlsFilter::is_secured(&pair.server.session));
    assert_eq!(pair.client.handler.notifications(), [TlsNotification::SessionSecured]);
    assert_eq!(pair.server.handler.notifications(), [TlsNotification::SessionSecured]);

    client.write(b"after".to_vec());
    pump(client, &pair.server.session);
    assert_eq!(pair.server.handler.received_bytes(), [b"after".to_vec()]);
}

/// 加密后引擎要求重新握手：后续写入缓存到握手再次完成，再按顺序加密下发。
#[test]
fn renegotiation_requested_by_wrap_buffers_later_writes() {
    let pair = toy_pair(client_options(), server_options());
    let client = &pair.client.session;
    pump(client, &pair.server.session);

    pair.factory.rekey.store(true, Ordering::SeqCst);
    client.write(b"first".to_vec());
    let handler = TlsFilter::session_handler(client).expect("tls handler");
    assert!(!handler.is_handshake_complete(), "重协商期间不应视为握手完成");
    assert!(!TlsFilter::is_secured(client));

    client.write(b"second".to_vec());
    assert_eq!(handler.pending_handshake_writes(), 1);

    let frames = pump(client, &pair.server.session);
    assert_eq!(kinds(&frames, true), [DATA, HELLO, DATA]);
    assert_eq!(kinds(&frames, false), [ACK]);
    assert!(handler.is_handshake_complete());
    assert_eq!(handler.pending_handshake_writes(), 0);
    assert_eq!(
        pair.server.handler.received_bytes(),
        [b"first".to_vec(), b"second".to_vec()]
    );
    assert_eq!(pair.client.handler.sent_bytes(), [b"first".to_vec(), b"second".to_vec()]);
    assert_eq!(pair.client.handler.notifications(), [TlsNotification::SessionSecured]);
    assert_eq!(pair.factory.tasks_run.load(Ordering::SeqCst), 2);
}

/// 握手阶段的引擎错误被归类为握手失败，会话随即关闭。
#[test]
#[traced_test]
fn handshake_failure_closes_session_with_handshake_error() {
    let server = endpoint();
    server
        .session
        .filter_chain()
        .add_last("tls", Arc::new(TlsFilter::new(ToyFactory::new())))
        .expect("tls filter");

    deliver(&server.session, &record(BAD, b""));

    assert!(server.session.is_closed(), "握手失败后会话应被关闭");
    assert!(server.handler.closed.load(Ordering::SeqCst));
    assert_eq!(server.handler.exception_codes(), [codes::HANDSHAKE_FAILED]);
    let exceptions = server.handler.exceptions.lock().expect("exceptions lock");
    let cause = exceptions[0].cause_as::<TlsError>().expect("tls error cause");
    assert!(cause.is_handshake());
    assert_eq!(cause.failure_class(), Some(TlsFailureClass::Integrity));
    assert!(logs_contain("closing session after tls handshake failure"));
}

/// 严格的引擎在输出空间不足时要求扩容，过滤器扩容后重试。
#[test]
fn overflowing_engine_buffers_grow() {
    let factory = ToyFactory::with_packet_size(2, true);
    let pair = toy_pair_with(factory, client_options(), server_options());
    pump(&pair.client.session, &pair.server.session);
    assert!(TlsFilter::is_secured(&pair.client.session));

    let payload = b"a payload much longer than the initial packet buffer".to_vec();
    pair.client.session.write(payload.clone());
    pump(&pair.client.session, &pair.server.session);
    assert_eq!(pair.server.handler.received_concat(), payload);
}

/// 被拆开的记录在入站缓冲中累积，凑齐后一次解出。
#[test]
fn split_records_are_reassembled() {
    let pair = toy_pair(client_options(), server_options());
    pump(&pair.client.session, &pair.server.session);

    pair.client.session.write(b"fragmented".to_vec());
    let wire = drain_wire(&pair.client.session);
    let (head, tail) = wire.split_at(5);

    deliver(&pair.server.session, head);
    assert!(pair.server.handler.received_bytes().is_empty(), "不完整的记录不应交付");
    deliver(&pair.server.session, tail);
    assert_eq!(pair.server.handler.received_bytes(), [b"fragmented".to_vec()]);
}

/// 一次读取中的多条记录全部解出，并保持字节顺序。
#[test]
fn coalesced_records_are_all_decrypted() {
    let pair = toy_pair(client_options(), server_options());
    pump(&pair.client.session, &pair.server.session);

    pair.client.session.write(b"first,".to_vec());
    pair.client.session.write(b"second".to_vec());
    let wire = drain_wire(&pair.client.session);
    assert_eq!(records(&wire).len(), 2);

    deliver(&pair.server.session, &wire);
    assert_eq!(pair.server.handler.received_concat(), b"first,second".to_vec());
}

/// 与握手结束报文一同到达的应用数据不会丢失。
#[test]
fn data_coalesced_with_final_handshake_record_is_delivered() {
    let pair = toy_pair(client_options(), server_options());

    let hello = drain_wire(&pair.client.session);
    deliver(&pair.server.session, &hello);
    assert!(TlsFilter::is_secured(&pair.server.session));

    pair.server.session.write(b"hi".to_vec());
    let wire = drain_wire(&pair.server.session);
    let record_kinds: Vec<u8> = records(&wire).into_iter().map(|(kind, _)| kind).collect();
    assert_eq!(record_kinds, [ACK, DATA]);

    deliver(&pair.client.session, &wire);
    assert!(TlsFilter::is_secured(&pair.client.session));
    assert_eq!(pair.client.handler.received_bytes(), [b"hi".to_vec()]);
    assert_eq!(pair.client.handler.notifications(), [TlsNotification::SessionSecured]);
}

/// 非字节的入站消息不经过引擎，原样向上传递。
#[test]
fn user_messages_pass_through_untouched() {
    let pair = toy_pair(client_options(), server_options());
    pump(&pair.client.session, &pair.server.session);

    pair.server
        .session
        .filter_chain()
        .fire_message_received(PipelineMessage::from_user(7_u32));
    let received = pair.server.handler.received.lock().expect("received lock");
    assert!(received.iter().any(|message| message.downcast_user::<u32>() == Some(&7)));
}
