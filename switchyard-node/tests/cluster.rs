use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use rkyv::{Archive, Deserialize, Serialize};
use switchyard_node::{
    ClientError,
    ClusterMembership,
    ConsistentHash,
    LoadBalancer,
    MembershipConfig,
    MemoryRegistry,
    NetworkClient,
    NetworkClientConfig,
    NetworkServer,
    NetworkServerConfig,
    NodeId,
    RoundRobin,
};
use switchyard_rpc::{ErrorCode, RkyvSerializer, Status};
use tokio::sync::mpsc as async_mpsc;

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Debug)]
#[archive(check_bytes)]
pub struct Ping {
    msg: String,
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Pong {
    node_id: NodeId,
    msg: String,
}

type PingSerializer = RkyvSerializer<Ping, Pong>;

struct Cluster {
    membership: ClusterMembership,
    nodes: Vec<(ClusterMembership, NetworkServer)>,
}

impl Cluster {
    async fn shutdown(self) {
        for (membership, server) in self.nodes {
            server.shutdown().await;
            membership.shutdown().await;
        }
        self.membership.shutdown().await;
    }
}

fn membership_config() -> MembershipConfig {
    MembershipConfig::new("ping-cluster").with_connect_timeout(Duration::from_secs(2))
}

async fn wait_for_node(membership: &ClusterMembership, node_id: NodeId) {
    for _ in 0..200 {
        if membership.current_nodes().contains(node_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Node {node_id} did not join within 2 seconds.");
}

/// Starts a cluster where every node answers pings, `configure` can
/// register additional handlers before the node binds.
async fn start_cluster(
    node_ids: &[NodeId],
    server_config: NetworkServerConfig,
    configure: impl Fn(&NetworkServer) -> anyhow::Result<()>,
) -> anyhow::Result<Cluster> {
    let registry = MemoryRegistry::new();
    let membership = ClusterMembership::new(registry.clone(), membership_config());
    membership.connect().await?;

    let addrs = test_helper::get_unused_addrs(node_ids.len());
    for (node_id, addr) in node_ids.iter().zip(addrs) {
        membership.add_node(*node_id, &addr.to_string()).await?;
        wait_for_node(&membership, *node_id).await;
    }

    let mut nodes = Vec::new();
    for node_id in node_ids.iter().copied() {
        let node_membership =
            ClusterMembership::new(registry.new_session(), membership_config());
        node_membership.connect().await?;

        let server = NetworkServer::new(server_config.clone(), node_membership.clone());
        server.register_handler(
            move |ping: Ping| -> Result<Pong, Status> {
                Ok(Pong {
                    node_id,
                    msg: ping.msg,
                })
            },
            PingSerializer::new(),
        )?;
        configure(&server)?;
        server.bind(node_id).await?;

        nodes.push((node_membership, server));
    }

    membership
        .wait_for_nodes(node_ids, Duration::from_secs(2))
        .await?;

    Ok(Cluster { membership, nodes })
}

fn client(cluster: &Cluster, balancer: impl LoadBalancer) -> anyhow::Result<NetworkClient> {
    let config = NetworkClientConfig::new("ping-cluster")
        .with_write_timeout(Duration::from_secs(2))
        .with_stale_request_cleanup_frequency(Duration::from_millis(50));
    Ok(NetworkClient::new(
        config,
        cluster.membership.clone(),
        balancer,
    )?)
}

fn ping(msg: &str) -> Ping {
    Ping {
        msg: msg.to_string(),
    }
}

#[tokio::test]
async fn test_two_node_ping() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = start_cluster(&[1, 2], NetworkServerConfig::default(), |_| Ok(())).await?;
    let client = client(&cluster, RoundRobin::new())?;

    let first = client
        .request(&ping("hello"), &PingSerializer::new())
        .await?;
    let second = client
        .request(&ping("world"), &PingSerializer::new())
        .await?;

    assert_eq!(
        first,
        Pong {
            node_id: 1,
            msg: "hello".to_string()
        }
    );
    assert_eq!(
        second,
        Pong {
            node_id: 2,
            msg: "world".to_string()
        }
    );

    client.shutdown();
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = start_cluster(&[1, 2, 3], NetworkServerConfig::default(), |_| Ok(())).await?;
    let client = client(&cluster, RoundRobin::new())?;

    let mut tasks = Vec::new();
    for task_id in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..20 {
                let msg = format!("{task_id}-{i}");
                let pong = client
                    .request(&ping(&msg), &PingSerializer::new())
                    .await?;
                assert_eq!(pong.msg, msg);
            }
            Ok::<_, ClientError>(())
        }));
    }

    for task in tasks {
        task.await??;
    }

    assert_eq!(client.num_in_flight(), 0);
    for node_id in [1, 2, 3] {
        assert!(client.pool().num_connections(node_id) <= client.config().max_connections_per_node);
    }

    client.shutdown();
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_consistent_hash_routing() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = start_cluster(&[1, 2, 3], NetworkServerConfig::default(), |_| Ok(())).await?;
    let client = client(&cluster, ConsistentHash)?;

    for key in ["users/1", "users/2", "orders/99"] {
        let mut owners = Vec::new();
        for _ in 0..3 {
            let handle = client
                .send_request_with_hint(&ping(key), &PingSerializer::new(), key.as_bytes())
                .await?;
            owners.push(handle.await?.node_id);
        }
        assert!(owners.windows(2).all(|w| w[0] == w[1]), "{key}: {owners:?}");
    }

    client.shutdown();
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_handler_errors_are_distinguishable() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = start_cluster(&[1], NetworkServerConfig::default(), |server| {
        server.register_handler(
            |_: Ping| -> Result<Pong, Status> { Err(Status::handler("Ping refused.")) },
            PingSerializer::with_name("refuse"),
        )?;
        Ok(())
    })
    .await?;
    let client = client(&cluster, RoundRobin::new())?;

    let err = client
        .request(&ping("hello"), &PingSerializer::with_name("refuse"))
        .await
        .unwrap_err();
    match err {
        ClientError::Handler(status) => {
            assert_eq!(status.code, ErrorCode::HandlerError);
            assert_eq!(status.message, "Ping refused.");
        },
        other => panic!("Expected a handler error, got {other:?}"),
    }
    assert!(!ClientError::Handler(Status::handler("")).is_retryable());

    let err = client
        .request(&ping("hello"), &PingSerializer::with_name("not-registered"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)), "{err:?}");

    // The node keeps serving after both errors.
    client
        .request(&ping("hello"), &PingSerializer::new())
        .await?;

    client.shutdown();
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_saturated_server_rejects_requests() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (started_tx, mut started_rx) = async_mpsc::unbounded_channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let release_rx = Mutex::new(release_rx);

    let handler = move |ping: Ping| -> Result<Pong, Status> {
        let _ = started_tx.lock().unwrap().send(());
        let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        Ok(Pong {
            node_id: 1,
            msg: ping.msg,
        })
    };
    let handler = std::sync::Arc::new(Mutex::new(Some(handler)));

    let server_config = NetworkServerConfig::default()
        .with_pool_size(1, 1)
        .with_request_queue_size(1);
    let cluster = start_cluster(&[1], server_config, move |server| {
        if let Some(handler) = handler.lock().unwrap().take() {
            server.register_handler(handler, PingSerializer::with_name("block"))?;
        }
        Ok(())
    })
    .await?;
    let client = client(&cluster, RoundRobin::new())?;
    let blocking = PingSerializer::with_name("block");

    // The only worker is busy with the first request and the second fills the queue.
    let running = client.send_request(&ping("running"), &blocking).await?;
    started_rx.recv().await;
    let queued = client.send_request(&ping("queued"), &blocking).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.request(&ping("rejected"), &blocking).await.unwrap_err();
    match &err {
        ClientError::Handler(status) => assert_eq!(status.code, ErrorCode::Overloaded),
        other => panic!("Expected an overloaded error, got {other:?}"),
    }
    assert!(err.is_retryable());

    release_tx.send(())?;
    release_tx.send(())?;
    assert_eq!(running.await?.msg, "running");
    assert_eq!(queued.await?.msg, "queued");

    client.shutdown();
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_node_shutdown_fails_with_connection_error() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = std::sync::Arc::new(Mutex::new(release_rx));

    let cluster = start_cluster(&[1], NetworkServerConfig::default(), move |server| {
        let release_rx = release_rx.clone();
        server.register_handler(
            move |ping: Ping| -> Result<Pong, Status> {
                let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
                Ok(Pong {
                    node_id: 1,
                    msg: ping.msg,
                })
            },
            PingSerializer::with_name("block"),
        )?;
        Ok(())
    })
    .await?;
    let client = client(&cluster, RoundRobin::new())?;

    let pending = client
        .send_request(&ping("hello"), &PingSerializer::with_name("block"))
        .await?;
    cluster.nodes[0].1.shutdown().await;

    let err = pending.await.map_err(ClientError::from).unwrap_err();
    assert!(matches!(err, ClientError::Connection(_)), "{err:?}");
    assert!(err.is_retryable());

    release_tx.send(())?;
    client.shutdown();
    cluster.shutdown().await;
    Ok(())
}
