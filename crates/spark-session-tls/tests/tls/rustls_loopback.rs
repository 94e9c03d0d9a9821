use std::sync::Arc;

use rcgen::{CertifiedKey, generate_simple_self_signed};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::ring::default_provider,
    pki_types::{CertificateDer, PrivatePkcs8KeyDer},
};
use spark_session_tls::{RustlsEngineFactory, TlsFilter, TlsFilterOptions};

use crate::support::{endpoint, pump};

const ALPN: &[u8] = b"spark";

fn configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_owned()]).expect("self-signed certificate");
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let mut server = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .expect("server protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der.into())
        .expect("server certificate");
    server.alpn_protocols = vec![ALPN.to_vec()];

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).expect("trust self-signed certificate");
    let mut client = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .expect("client protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();
    client.alpn_protocols = vec![ALPN.to_vec()];

    (Arc::new(server), Arc::new(client))
}

/// 真实 rustls 引擎的端到端往返：握手、ALPN、双向数据与 `close_notify`。
#[test]
fn rustls_sessions_exchange_data_over_the_filter_chain() {
    let (server_config, client_config) = configs();
    let server = endpoint();
    let client = endpoint();

    server
        .session
        .filter_chain()
        .add_last(
            "tls",
            Arc::new(TlsFilter::new(Arc::new(RustlsEngineFactory::server(server_config)))),
        )
        .expect("server tls filter");
    client
        .session
        .filter_chain()
        .add_last(
            "tls",
            Arc::new(TlsFilter::with_options(
                Arc::new(RustlsEngineFactory::client(client_config)),
                TlsFilterOptions::client("localhost"),
            )),
        )
        .expect("client tls filter");

    pump(&client.session, &server.session);
    assert!(TlsFilter::is_secured(&client.session), "客户端握手应完成");
    assert!(TlsFilter::is_secured(&server.session), "服务端握手应完成");
    assert_eq!(TlsFilter::negotiated_protocol(&client.session).as_deref(), Some(ALPN));
    assert_eq!(TlsFilter::negotiated_protocol(&server.session).as_deref(), Some(ALPN));

    client.session.write(b"ping".to_vec());
    let frames = pump(&client.session, &server.session);
    assert!(
        frames.iter().all(|frame| !frame.bytes.windows(4).any(|window| window == b"ping")),
        "线上不应出现明文"
    );
    assert_eq!(server.handler.received_concat(), b"ping".to_vec());

    server.session.write(b"pong".to_vec());
    pump(&client.session, &server.session);
    assert_eq!(client.handler.received_concat(), b"pong".to_vec());
    assert_eq!(client.handler.sent_bytes(), [b"ping".to_vec()]);

    client.session.close_now();
    pump(&client.session, &server.session);
    assert!(client.session.is_closed());
    assert!(!TlsFilter::is_tls_started(&server.session), "收到 close_notify 后服务端应结束 TLS");
    assert!(client.handler.exception_codes().is_empty());
    assert!(server.handler.exception_codes().is_empty());
}

/// 替换配置只影响之后创建的引擎。
#[test]
fn replacing_server_config_returns_previous_snapshot() {
    let (first, _) = configs();
    let (second, _) = configs();
    let factory = RustlsEngineFactory::server(Arc::clone(&first));

    let previous = factory.replace_server_config(Arc::clone(&second)).expect("previous config");
    assert!(Arc::ptr_eq(&previous, &first));
    assert!(factory.server_config().is_some_and(|current| Arc::ptr_eq(&current, &second)));
    assert!(factory.client_config().is_none());
}
