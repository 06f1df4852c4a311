//! Communicator handshake and bootstrap tests, run against loopback
//! endpoints inside one process.

mod support;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use plexus_com::{
    ClientMode, Communicator, CommunicatorConfig, CommunicatorClient, ConnectionLifecycle,
    LinkerService, ServiceRegistry,
};
use plexus_net_utils::NodeAddress;
use plexus_protocol::{ErrorCode, ExchangeId};
use plexus_rpc::{Administrator, ObjectRef};

use support::{
    widget_object, widget_pair, Widget, RPC_TIMEOUT, WIDGET_INTERFACE, WIDGET_VERSION,
};

async fn widget_server() -> Communicator {
    let administrator = Administrator::new();
    administrator.announce_factory(widget_pair());

    let registry = ServiceRegistry::new();
    registry.register("Widget", Arc::new(|_version| Some(widget_object())));

    let address = NodeAddress::from_str("127.0.0.1:0").unwrap();
    Communicator::open(administrator, registry, &address, CommunicatorConfig::default())
        .await
        .unwrap()
}

fn widget_client(server: &Communicator) -> CommunicatorClient {
    let administrator = Administrator::new();
    administrator.announce_factory(widget_pair());
    CommunicatorClient::new(
        administrator,
        server.connector().clone(),
        ClientMode::Acquire {
            class_name: "Widget".into(),
            interface: WIDGET_INTERFACE,
            version: WIDGET_VERSION,
        },
    )
}

async fn eventually(predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn in_process_acquire() {
    let server = widget_server().await;
    let client = widget_client(&server);

    client.open(RPC_TIMEOUT).await.unwrap();

    let widget = client.root(RPC_TIMEOUT).await.unwrap();
    let widget = ObjectRef::<dyn Widget>::from_remote(widget).unwrap();
    assert_eq!(widget.magic().await.unwrap(), 42);

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_class_yields_no_object() {
    let server = widget_server().await;

    let administrator = Administrator::new();
    administrator.announce_factory(widget_pair());
    let client = CommunicatorClient::new(
        administrator,
        server.connector().clone(),
        ClientMode::Acquire {
            class_name: "NoSuchClass".into(),
            interface: WIDGET_INTERFACE,
            version: WIDGET_VERSION,
        },
    );

    // The handshake itself succeeds; the peer just has nothing to offer.
    client.open(RPC_TIMEOUT).await.unwrap();
    assert_eq!(client.root(RPC_TIMEOUT).await.unwrap_err(), ErrorCode::Unavailable);

    server.shutdown().await;
}

#[tokio::test]
async fn open_against_dead_endpoint_is_opening_failed() {
    let administrator = Administrator::new();
    let client = CommunicatorClient::new(
        administrator.clone(),
        NodeAddress::from_str("127.0.0.1:1").unwrap(),
        ClientMode::Plain,
    );

    assert_eq!(
        client.open(Duration::from_millis(500)).await.unwrap_err(),
        ErrorCode::OpeningFailed,
    );
    // No proxy was created.
    assert_eq!(administrator.live_proxies(), 0);
}

#[tokio::test]
async fn connection_lifecycle_and_close_drain() {
    let server = widget_server().await;
    let client = widget_client(&server);

    client.open(RPC_TIMEOUT).await.unwrap();
    eventually(|| server.connections().len() == 1).await;

    let connection = server.connections().pop().unwrap();
    assert!(connection.id().0 > 0);
    assert_eq!(connection.lifecycle(), ConnectionLifecycle::Active);

    let widget = client.root(RPC_TIMEOUT).await.unwrap();
    let widget = ObjectRef::<dyn Widget>::from_remote(widget).unwrap();
    assert_eq!(widget.magic().await.unwrap(), 42);

    client.close().await;
    eventually(|| server.connections().is_empty()).await;

    // Dead proxies short-circuit.
    assert_eq!(widget.magic().await.unwrap_err(), ErrorCode::Unavailable);

    server.shutdown().await;
}

#[tokio::test]
async fn racing_acquires_get_distinct_instances() {
    let server = widget_server().await;

    let first = widget_client(&server);
    let second = widget_client(&server);
    first.open(RPC_TIMEOUT).await.unwrap();
    second.open(RPC_TIMEOUT).await.unwrap();

    let first_widget = first.root(RPC_TIMEOUT).await.unwrap();
    let second_widget = second.root(RPC_TIMEOUT).await.unwrap();

    // A class is a factory, not a singleton.
    assert_ne!(first_widget.identity(), second_widget.identity());

    server.shutdown().await;
}

#[tokio::test]
async fn offered_object_reaches_the_server() {
    let server = widget_server().await;

    let administrator = Administrator::new();
    administrator.announce_factory(widget_pair());
    let client = CommunicatorClient::new(
        administrator,
        server.connector().clone(),
        ClientMode::Offer {
            object: widget_object(),
            exchange: ExchangeId(99),
        },
    );
    client.open(RPC_TIMEOUT).await.unwrap();

    eventually(|| server.connections().len() == 1).await;
    let connection = server.connections().pop().unwrap();
    eventually(|| connection.offered().is_some()).await;

    let (instance, interface) = connection.offered().unwrap();
    assert!(!instance.is_empty());
    assert_eq!(interface, WIDGET_INTERFACE);

    // The offerer pinned the object on its channel; the server can import
    // it without a further announce and call straight through.
    let widget = server
        .administrator()
        .proxy_object(connection.channel(), instance, interface, true, RPC_TIMEOUT)
        .await
        .unwrap();
    let widget = ObjectRef::<dyn Widget>::from_remote(widget).unwrap();
    assert_eq!(widget.magic().await.unwrap(), 42);

    drop(widget);
    server.shutdown().await;
}

#[tokio::test]
async fn distributed_link_relays_through_both_hosts() {
    // Host B: owns the class and accepts link requests.
    let host_b_administrator = Administrator::new();
    host_b_administrator.announce_factory(widget_pair());
    let host_b_registry = ServiceRegistry::new();
    host_b_registry.register("Widget", Arc::new(|_version| Some(widget_object())));
    let linker = LinkerService::new(host_b_administrator.clone(), host_b_registry.clone());
    linker.publish();

    let host_b = Communicator::open(
        host_b_administrator,
        host_b_registry,
        &NodeAddress::from_str("127.0.0.1:0").unwrap(),
        CommunicatorConfig::default(),
    )
    .await
    .unwrap();

    // Host A: forwards acquires for the class to host B.
    let host_a_administrator = Administrator::new();
    host_a_administrator.announce_factory(widget_pair());
    let host_a = Communicator::open(
        host_a_administrator,
        ServiceRegistry::new(),
        &NodeAddress::from_str("127.0.0.1:0").unwrap(),
        CommunicatorConfig::default(),
    )
    .await
    .unwrap();
    host_a.register_remote("Widget", host_b.connector().clone());

    // A plain client of host A; the relay is invisible to it.
    let client = widget_client(&host_a);
    client.open(RPC_TIMEOUT).await.unwrap();

    let widget = client.root(RPC_TIMEOUT).await.unwrap();
    let widget = ObjectRef::<dyn Widget>::from_remote(widget).unwrap();
    assert_eq!(widget.magic().await.unwrap(), 42);

    // Host A holds the imported proxy that backs the relay.
    assert!(host_a.administrator().live_proxies() >= 1);

    drop(widget);
    host_a.shutdown().await;
    host_b.shutdown().await;
}
