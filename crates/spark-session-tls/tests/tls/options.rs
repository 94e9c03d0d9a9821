use std::{net::SocketAddr, sync::Arc};

use spark_session_tls::{PEER_ADDRESS, TlsFilter, TlsFilterOptions, USE_NOTIFICATION};

use crate::support::{ToyFactory, endpoint};

#[test]
fn options_load_from_toml() {
    let options: TlsFilterOptions = toml::from_str(
        r#"
        client_mode = true
        use_notification = true
        server_name = "svc.internal"
        "#,
    )
    .expect("parse options");

    assert!(options.auto_start, "缺省字段应取默认值");
    assert!(options.client_mode);
    assert!(options.use_notification);
    assert_eq!(options.server_name.as_deref(), Some("svc.internal"));
}

#[test]
fn empty_toml_yields_server_defaults() {
    let options: TlsFilterOptions = toml::from_str("").expect("parse options");
    assert_eq!(options, TlsFilterOptions::server());
}

/// `PEER_ADDRESS` 属性优先于会话自身的对端地址，通知选项写入会话标记。
#[test]
fn peer_address_attribute_overrides_session_peer() {
    let factory = ToyFactory::new();
    let fx = endpoint();
    let announced: SocketAddr = "198.51.100.7:8443".parse().expect("addr");
    fx.session.attributes().insert(PEER_ADDRESS, announced);

    let options = TlsFilterOptions::client("svc.internal").with_notification(true);
    fx.session
        .filter_chain()
        .add_last("tls", Arc::new(TlsFilter::with_options(factory.clone(), options)))
        .expect("tls filter");

    let requests = factory.requests.lock().expect("requests lock");
    assert_eq!(
        requests.as_slice(),
        [(true, Some("svc.internal".to_owned()), Some(announced))]
    );
    assert!(fx.session.attributes().contains(USE_NOTIFICATION));
}
