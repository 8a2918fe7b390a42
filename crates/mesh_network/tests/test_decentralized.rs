use std::time::Duration;

use mesh_network::transport::message_handler;
use mesh_network::{AgentInfo, AgentNetwork, Message, NetworkConfig, NetworkError, TopologyMode};
use serde_json::json;
use tokio::sync::mpsc;

async fn peer(name: &str, bootstrap: Vec<String>) -> AgentNetwork {
    let mut config = NetworkConfig::peer("127.0.0.1", 0, bootstrap);
    config.discovery_interval = Duration::from_millis(100);
    config.heartbeat_interval = Duration::from_millis(100);
    let mut network = AgentNetwork::new(name, config).unwrap();
    network.start().await.unwrap();
    network
}

async fn knows(network: &AgentNetwork, agent_id: &str) -> bool {
    for _ in 0..50 {
        if network.discover_agents(&[]).await.iter().any(|a| a.agent_id == agent_id) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    false
}

#[tokio::test]
async fn isolated_peers_only_see_their_own_agents() {
    let mut peers = Vec::new();
    for name in ["p1", "p2", "p3"] {
        let network = peer(name, vec![]).await;
        network.register_agent(AgentInfo::new(format!("{name}-agent"))).await.unwrap();
        peers.push(network);
    }

    for (network, name) in peers.iter().zip(["p1", "p2", "p3"]) {
        let seen: Vec<String> = network
            .discover_agents(&[])
            .await
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        assert_eq!(seen, vec![format!("{name}-agent")]);
        assert_eq!(network.network_info().mode, TopologyMode::Decentralized);
    }

    for mut network in peers {
        network.stop().await.unwrap();
    }
}

#[tokio::test]
async fn bootstrap_join_and_direct_message() {
    let mut seed = peer("seed", vec![]).await;
    seed.register_agent(AgentInfo::new("planner").with_capabilities(["plan"])).await.unwrap();
    let seed_addr = seed.local_addr().unwrap().to_string();

    let mut joiner = peer("joiner", vec![seed_addr]).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    joiner.on_message(message_handler(move |_peer, message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
        }
    }));
    joiner.register_agent(AgentInfo::new("worker")).await.unwrap();

    assert!(knows(&joiner, "planner").await);
    assert!(knows(&seed, "worker").await);
    let planners = joiner.discover_agents(&["plan".into()]).await;
    assert_eq!(planners.len(), 1);

    let sent = seed
        .send_message(&Message::direct("planner", "worker", "task", json!({"step": 1})))
        .await
        .unwrap();
    assert_eq!(sent, 1);

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.sender_id, "planner");
    assert_eq!(received.payload["step"], 1);

    joiner.stop().await.unwrap();
    seed.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_target_has_no_route() {
    let mut lonely = peer("lonely", vec![]).await;
    lonely.register_agent(AgentInfo::new("me")).await.unwrap();

    let result = lonely
        .send_message(&Message::direct("me", "stranger", "text", json!({})))
        .await;
    assert!(matches!(result, Err(NetworkError::RouteUnavailable(_))));
    lonely.stop().await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_agent_but_the_sender() {
    let mut seed = peer("seed", vec![]).await;
    let mut joiner = peer("joiner", vec![seed.local_addr().unwrap().to_string()]).await;
    let mut inboxes = Vec::new();
    for network in [&seed, &joiner] {
        let (tx, rx) = mpsc::unbounded_channel();
        network.on_message(message_handler(move |_peer, message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        }));
        inboxes.push(rx);
    }
    seed.register_agent(AgentInfo::new("caller")).await.unwrap();
    seed.register_agent(AgentInfo::new("neighbour")).await.unwrap();
    joiner.register_agent(AgentInfo::new("far")).await.unwrap();
    assert!(knows(&seed, "far").await);

    let sent = seed
        .send_message(&Message::broadcast("caller", "alert", json!({"level": 2})))
        .await
        .unwrap();
    assert_eq!(sent, 2);

    for rx in inboxes.iter_mut() {
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.sender_id, "caller");
        assert_eq!(received.payload["level"], 2);
    }

    joiner.stop().await.unwrap();
    seed.stop().await.unwrap();
}
