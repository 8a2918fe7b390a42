use std::time::Duration;

use mesh_network::routing::route_handler;
use mesh_network::transport::message_handler;
use mesh_network::{
    AgentClient, AgentInfo, AgentNetwork, Message, ModInfo, ModManifest, NetworkConfig, NetworkError,
};
use serde_json::{Map, json};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

async fn coordinator(name: &str) -> (AgentNetwork, u16) {
    let mut network = AgentNetwork::new(name, NetworkConfig::coordinator("127.0.0.1", 0)).unwrap();
    network.start().await.unwrap();
    let port = network.local_addr().unwrap().port();
    (network, port)
}

/// A registered client whose every incoming message lands in the receiver.
async fn agent(
    id: &str,
    port: u16,
    capabilities: &[&str],
) -> (AgentClient, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut client = AgentClient::new(id);
    client.set_default_message_handler(route_handler(move |message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
        }
    }));
    client.connect_to_server("127.0.0.1", port).await.unwrap();
    let caps = capabilities.iter().map(|c| c.to_string()).collect();
    client.register(caps, Map::new()).await.unwrap();
    (client, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("handler channel closed")
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Message>) {
    tokio::time::sleep(QUIET).await;
    assert!(rx.try_recv().is_err(), "unexpected extra message");
}

#[tokio::test]
async fn direct_message_reaches_only_the_target() {
    let (mut network, port) = coordinator("direct-net").await;
    let (mut alice, mut alice_rx) = agent("alice", port, &[]).await;
    let (mut bob, mut bob_rx) = agent("bob", port, &[]).await;

    alice.send_direct_message("bob", "text", json!({"text": "hi"})).await.unwrap();

    let received = next(&mut bob_rx).await;
    assert_eq!(received.sender_id, "alice");
    assert_eq!(received.target_id.as_deref(), Some("bob"));
    assert_eq!(received.payload["text"], "hi");
    assert_silent(&mut bob_rx).await;
    assert!(alice_rx.try_recv().is_err());

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    network.stop().await.unwrap();
}

#[tokio::test]
async fn broadcast_is_delivered_once_to_everyone_else() {
    let (mut network, port) = coordinator("broadcast-net").await;
    let (mut sender, mut sender_rx) = agent("sender", port, &[]).await;
    let mut receivers = Vec::new();
    for i in 0..3 {
        receivers.push(agent(&format!("listener-{i}"), port, &[]).await);
    }

    let sent = sender.send_broadcast_message("news", json!({"n": 1})).await.unwrap();
    let broadcast_id = sent.broadcast_id.clone().unwrap();

    for (_, rx) in receivers.iter_mut() {
        let received = next(rx).await;
        assert_eq!(received.sender_id, "sender");
        assert_eq!(received.broadcast_id.as_deref(), Some(broadcast_id.as_str()));
        assert_eq!(received.payload["n"], 1);
    }
    for (_, rx) in receivers.iter_mut() {
        assert_silent(rx).await;
    }
    assert!(sender_rx.try_recv().is_err());

    sender.disconnect().await.unwrap();
    for (mut client, _) in receivers {
        client.disconnect().await.unwrap();
    }
    network.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_registration_needs_force_or_certificate() {
    let (mut network, port) = coordinator("dup-net").await;
    let (mut first, _first_rx) = agent("carol", port, &[]).await;

    let mut second = AgentClient::new("carol");
    second.connect_to_server("127.0.0.1", port).await.unwrap();
    let refused = second.register(vec![], Map::new()).await;
    assert!(matches!(refused, Err(NetworkError::RegistrationRejected(_))));

    let accepted = second
        .register_with_options(vec!["v2".into()], Map::new(), None, true)
        .await
        .unwrap();
    assert!(accepted.success);
    assert_eq!(accepted.network_name, "dup-net");
    assert_eq!(second.network_name(), Some("dup-net"));

    // A certificate for the id also wins over the live registration.
    let certificate = second.request_claim_agent_id(false).await.unwrap();
    assert!(second.request_validate_certificate(&certificate).await.unwrap());

    let mut third = AgentClient::new("carol");
    third.connect_to_server("127.0.0.1", port).await.unwrap();
    third
        .register_with_options(vec!["v3".into()], Map::new(), Some(certificate), false)
        .await
        .unwrap();

    let carols = network.discover_agents(&[]).await;
    assert_eq!(carols.len(), 1);
    assert!(carols[0].capabilities.contains("v3"));
    assert!(!carols[0].capabilities.contains("v2"));

    for client in [&mut first, &mut second, &mut third] {
        client.disconnect().await.unwrap();
    }
    network.stop().await.unwrap();
}

#[tokio::test]
async fn disconnect_removes_agent_from_registry() {
    let (mut network, port) = coordinator("leave-net").await;
    let (mut dave, _rx) = agent("dave", port, &["search"]).await;
    assert_eq!(network.discover_agents(&["search".into()]).await.len(), 1);

    dave.disconnect().await.unwrap();
    let mut gone = false;
    for _ in 0..50 {
        if network.discover_agents(&[]).await.is_empty() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert!(gone, "dave still registered after disconnect");
    network.stop().await.unwrap();
}

#[tokio::test]
async fn control_plane_commands() {
    let (mut network, port) = coordinator("control-net").await;
    network.register_mod(
        ModInfo::new("messaging", "mods.messaging")
            .with_version("1.0.0")
            .with_capabilities(["send"]),
    );
    network.register_manifest(ModManifest {
        mod_name: "messaging".into(),
        description: Some("Thread messaging".into()),
        ..Default::default()
    });

    let (mut erin, _erin_rx) = agent("erin", port, &["search", "summarize"]).await;
    let (mut frank, _frank_rx) = agent("frank", port, &["search"]).await;

    let mut all: Vec<String> = erin
        .request_list_agents(&[])
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.agent_id)
        .collect();
    all.sort();
    assert_eq!(all, vec!["erin".to_string(), "frank".to_string()]);

    let summarizers = frank.request_list_agents(&["summarize".into()]).await.unwrap();
    assert_eq!(summarizers.len(), 1);
    assert_eq!(summarizers[0].agent_id, "erin");

    let mods = erin.request_list_mods().await.unwrap();
    assert_eq!(mods.len(), 1);
    assert_eq!(mods[0].version.as_deref(), Some("1.0.0"));
    assert_eq!(mods[0].description.as_deref(), Some("Thread messaging"));

    let manifest = erin.request_get_mod_manifest("messaging").await.unwrap();
    assert_eq!(manifest.implementation.as_deref(), Some("mods.messaging"));
    assert!(erin.request_get_mod_manifest("missing").await.is_err());

    let ping = erin.request_ping(Some("frank")).await.unwrap();
    assert_eq!(ping.data["reachable"], true);

    let info = frank.request_network_info().await.unwrap();
    assert_eq!(info.network_name, "control-net");
    assert_eq!(info.agent_count, 2);
    assert_eq!(info.mods, vec!["messaging".to_string()]);
    assert_eq!(info.listen_address, format!("127.0.0.1:{port}"));

    erin.disconnect().await.unwrap();
    frank.disconnect().await.unwrap();
    network.stop().await.unwrap();
}

#[tokio::test]
async fn message_to_unknown_agent_fails() {
    let (mut network, port) = coordinator("void-net").await;
    let (mut alice, mut alice_rx) = agent("alice", port, &[]).await;
    let (mut bob, mut bob_rx) = agent("bob", port, &[]).await;

    let result = alice.send_direct_message("nobody", "text", json!({})).await;
    assert!(matches!(result, Err(NetworkError::AgentNotFound(id)) if id == "nobody"));
    assert_silent(&mut bob_rx).await;
    assert!(alice_rx.try_recv().is_err());

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    network.stop().await.unwrap();
}

#[tokio::test]
async fn unregister_frees_the_agent_id() {
    let (mut network, port) = coordinator("exit-net").await;
    let (mut gina, _gina_rx) = agent("gina", port, &["draft"]).await;
    let (mut hal, mut hal_rx) = agent("hal", port, &[]).await;

    gina.unregister().await.unwrap();
    assert!(gina.is_connected());
    assert!(gina.network_name().is_none());

    let listed: Vec<String> = hal
        .request_list_agents(&[])
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.agent_id)
        .collect();
    assert_eq!(listed, vec!["hal".to_string()]);

    // No longer registered, so nothing can be sent under the old id.
    let refused = gina.send_broadcast_message("news", json!({})).await;
    assert!(matches!(refused, Err(NetworkError::AgentNotFound(id)) if id == "gina"));
    assert_silent(&mut hal_rx).await;

    // The id is free again, even over the same link.
    let again = gina.register(vec![], Map::new()).await.unwrap();
    assert!(again.success);
    assert_eq!(network.discover_agents(&[]).await.len(), 2);

    gina.disconnect().await.unwrap();
    hal.disconnect().await.unwrap();
    network.stop().await.unwrap();
}

#[tokio::test]
async fn coordinator_broadcast_reaches_hosted_and_remote_agents() {
    let (mut network, port) = coordinator("host-net").await;
    let (tx, mut hosted_rx) = mpsc::unbounded_channel();
    network.on_message(message_handler(move |_peer, message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
        }
    }));
    network.register_agent(AgentInfo::new("host-a")).await.unwrap();
    network.register_agent(AgentInfo::new("host-b")).await.unwrap();
    let (mut remote, mut remote_rx) = agent("remote", port, &[]).await;

    let sent = network
        .send_message(&Message::broadcast("host-a", "news", json!({"n": 7})))
        .await
        .unwrap();
    assert_eq!(sent, 2);

    let hosted = next(&mut hosted_rx).await;
    let relayed = next(&mut remote_rx).await;
    assert_eq!(hosted.sender_id, "host-a");
    assert_eq!(relayed.payload["n"], 7);
    assert_eq!(hosted.broadcast_id, relayed.broadcast_id);
    assert_silent(&mut hosted_rx).await;

    remote.disconnect().await.unwrap();
    network.stop().await.unwrap();
}
