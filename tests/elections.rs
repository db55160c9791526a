mod fixtures;

use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use fixtures::RaftRouter;

/// When the leader dies, the remaining voters elect a replacement in a
/// strictly higher term, and writes keep committing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    for id in 1..=3 {
        router.new_node(id).await?;
    }
    router.node(1).await.initialize(btreeset![1, 2, 3]).await?;
    let first_leader = router.wait_for_leader(Duration::from_secs(2)).await?;
    router.wait_for_commit(2, Duration::from_secs(2)).await?;
    let first_term = router.node(first_leader).await.metrics().borrow().current_term;

    router.remove_node(first_leader).await;

    let second_leader = router.wait_for_leader(Duration::from_secs(3)).await?;
    assert_ne!(second_leader, first_leader);
    let metrics = router.node(second_leader).await.metrics().borrow().clone();
    assert!(
        metrics.current_term > first_term,
        "a new leadership implies a new term ({} vs {first_term})",
        metrics.current_term
    );

    // The survivors still form a majority of three; writes commit.
    router.node(second_leader).await.client_write(42).await?;
    router
        .wait_for_commit(metrics.last_log_index + 1, Duration::from_secs(2))
        .await?;

    router.shutdown_all().await;
    Ok(())
}

/// A node cut off from the cluster calls elections in vain and falls behind
/// on the log; once healed it can never win leadership, and the cluster
/// reconverges on a leader with the complete log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn healed_node_rejoins_without_winning_leadership() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new();
    for id in 1..=3 {
        router.new_node(id).await?;
    }
    router.node(1).await.initialize(btreeset![1, 2, 3]).await?;
    let leader = router.wait_for_leader(Duration::from_secs(2)).await?;
    router.wait_for_commit(2, Duration::from_secs(2)).await?;

    let cut = if leader == 3 { 2 } else { 3 };
    router.isolate(cut).await;
    // Commit a write the cut node misses, then give it time to call several
    // hopeless elections and inflate its own term.
    router.node(leader).await.client_write(7).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    router.restore(cut).await;

    // The healed node's inflated term may force a re-election, but its stale
    // log disqualifies it; a node holding the write must lead again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let final_leader = loop {
        if let Some(current) = router.current_leader().await {
            let settled = router.node(cut).await.metrics().borrow().current_leader == Some(current);
            if settled {
                break current;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "cluster never settled after healing");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_ne!(final_leader, cut, "a node missing committed entries must not lead");

    // Everyone, the healed node included, converges on the committed write.
    router.wait_for_commit(3, Duration::from_secs(3)).await?;

    router.shutdown_all().await;
    Ok(())
}
