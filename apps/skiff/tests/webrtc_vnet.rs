//! Two real WebRTC peer connections, negotiated through the relay, carrying
//! data over a virtual network so no host interfaces are involved.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use skiff::config::Config;
use skiff::transport::webrtc::WebRtcTransportFactory;
use skiff::{Events, Peer, PeerEvent, PeerId};
use tokio::sync::Mutex as AsyncMutex;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

async fn attach_vnet_to_router(vnet: &Arc<Net>, router: &Arc<AsyncMutex<Router>>) {
    let nic = vnet.get_nic().unwrap();
    router.lock().await.add_net(Arc::clone(&nic)).await.unwrap();
    nic.lock()
        .await
        .set_router(Arc::clone(router))
        .await
        .unwrap();
}

fn factory_on(vnet: Arc<Net>) -> Arc<WebRtcTransportFactory> {
    let mut setting = SettingEngine::default();
    setting.set_vnet(Some(vnet));
    setting.set_ice_timeouts(
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(1)),
        Some(Duration::from_millis(200)),
    );
    Arc::new(WebRtcTransportFactory::with_setting_engine(setting, &[]).unwrap())
}

async fn open_peer(config: &Config, factory: Arc<WebRtcTransportFactory>) -> (Peer, Events, PeerId) {
    let (peer, mut events) = Peer::open(config, factory).await.unwrap();
    match events.next().await {
        Some(PeerEvent::Open { identity }) => (peer, events, identity),
        other => panic!("expected identity, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn webrtc_peers_exchange_payloads_over_vnet() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let wan = Arc::new(AsyncMutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .unwrap(),
    ));
    let a_net = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.2".to_owned()],
        ..Default::default()
    })));
    attach_vnet_to_router(&a_net, &wan).await;
    let b_net = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.3".to_owned()],
        ..Default::default()
    })));
    attach_vnet_to_router(&b_net, &wan).await;
    wan.lock().await.start().await.unwrap();

    let (addr, _relay) = skiff_relay::spawn("127.0.0.1:0").await.unwrap();
    let config = Config {
        relay_host: addr.ip().to_string(),
        relay_port: addr.port(),
        stun_urls: Vec::new(),
        keepalive: None,
        ..Config::default()
    };

    let (a, mut a_events, a_id) = open_peer(&config, factory_on(a_net)).await;
    let (_b, mut b_events, b_id) = open_peer(&config, factory_on(b_net)).await;

    a.connect(&b_id).await.unwrap();
    assert_eq!(
        a_events.next().await,
        Some(PeerEvent::Connected {
            remote: b_id.clone()
        })
    );
    assert_eq!(
        b_events.next().await,
        Some(PeerEvent::Connected {
            remote: a_id.clone()
        })
    );

    a.send("hi").await.unwrap();
    assert_eq!(
        b_events.next().await,
        Some(PeerEvent::Message {
            remote: a_id,
            payload: Bytes::from_static(b"hi"),
        })
    );
}
