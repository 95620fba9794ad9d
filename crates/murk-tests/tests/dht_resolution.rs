//! Connecting to a peer known only by identity, resolved through the DHT.

use std::time::Duration;

use murk_node::NodeConfig;
use murk_tests::TestNetwork;

#[tokio::test]
async fn test_connect_by_node_id_via_lookup() {
    murk_tests::init_tracing();
    let mut network = TestNetwork::with_nodes(3, NodeConfig::default());
    network.bootstrap_all().await.unwrap();

    // Let the self-lookups spread addresses through the seed.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Node 1 dials node 2 with no address hint.
    let target = network.node(2).node_id;
    let conn = network
        .node(1)
        .connect_to_id(target)
        .await
        .unwrap();
    network
        .node(1)
        .send(conn, b"found you".to_vec())
        .await
        .unwrap();

    let received = network
        .node_mut(2)
        .collect_data(9, Duration::from_secs(10))
        .await;
    assert_eq!(received, b"found you");
}
