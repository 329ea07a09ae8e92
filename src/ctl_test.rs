use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::clock::MockClock;
use crate::cluster::{ClusterControlManager, ClusterView};
use crate::config::Config;
use crate::ctl::{request, ClusterCtl, ClusterCtlMsg};
use crate::error::ControllerError;
use crate::fixtures::{self, heartbeat};
use crate::log::LocalLog;
use crate::placement::RandomReplicaPlacer;
use crate::BrokerId;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    config: Arc<Config>,
    clock: Arc<MockClock>,
    view: ClusterView,
    requests_tx: mpsc::Sender<ClusterCtlMsg>,
    shutdown_tx: broadcast::Sender<()>,
    offset_rx: watch::Receiver<i64>,
    handle: JoinHandle<Result<()>>,
}

fn spawn_ctl() -> Harness {
    let config = Arc::new(Config::new_test());
    let clock = Arc::new(MockClock::new());
    let manager = ClusterControlManager::new(
        clock.clone(),
        config.session_timeout(),
        Box::new(RandomReplicaPlacer::new(StdRng::seed_from_u64(0))),
    );
    let view = manager.view();
    let (log, committed_rx) = LocalLog::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    let (requests_tx, requests_rx) = mpsc::channel(10);
    let (ctl, offset_rx) = ClusterCtl::new(config.clone(), manager, Box::new(log), committed_rx, shutdown_tx.clone(), requests_rx);
    Harness {
        config,
        clock,
        view,
        requests_tx,
        shutdown_tx,
        offset_rx,
        handle: ctl.spawn(),
    }
}

impl Harness {
    async fn register(&self, id: BrokerId) -> Result<i64> {
        let reply = request(&self.requests_tx, |tx| ClusterCtlMsg::Register {
            request: fixtures::registration_request(id, None),
            tx,
        })
        .await??;
        Ok(reply.epoch)
    }

    async fn register_and_unfence(&self, id: BrokerId) -> Result<i64> {
        let epoch = self.register(id).await?;
        let offset = *self.offset_rx.borrow();
        let reply = request(&self.requests_tx, |tx| ClusterCtlMsg::Heartbeat {
            request: heartbeat(id, epoch, offset, false, false),
            tx,
        })
        .await??;
        assert!(!reply.is_fenced, "expected broker {} to be unfenced by its heartbeat", id);
        Ok(epoch)
    }

    fn unfenced(&self, id: BrokerId) -> Result<bool> {
        let snapshot = self.view.latest_snapshot().context("expected a retained snapshot")?;
        Ok(self.view.unfenced_at(id, snapshot)?)
    }

    async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        tokio::time::timeout(TIMEOUT, self.handle).await.context("timeout waiting for controller shutdown")??
    }
}

#[tokio::test]
async fn register_and_heartbeat_unfences_broker() -> Result<()> {
    let harness = spawn_ctl();

    let epoch = harness.register(1).await?;
    assert!(epoch == 0, "expected first registration to be assigned epoch 0, got {}", epoch);
    assert!(*harness.offset_rx.borrow() == 0, "expected registration to be applied before its reply");
    assert!(!harness.unfenced(1)?, "expected newly registered broker to be fenced");

    let reply = request(&harness.requests_tx, |tx| ClusterCtlMsg::Heartbeat {
        request: heartbeat(1, epoch, 0, false, false),
        tx,
    })
    .await??;
    assert!(reply.is_caught_up, "expected broker to be caught up");
    assert!(!reply.is_fenced, "expected broker to be unfenced");
    assert!(harness.unfenced(1)?, "expected unfencing to be applied before the heartbeat reply");

    let registrations = harness.view.broker_registrations_at(*harness.offset_rx.borrow())?;
    let registration = registrations.get(&1).context("expected broker 1 to be registered")?;
    assert!(registration.epoch == epoch, "unexpected registration epoch {}, expected {}", registration.epoch, epoch);

    harness.shutdown().await
}

#[tokio::test]
async fn rejected_requests_reply_with_error() -> Result<()> {
    let harness = spawn_ctl();
    let offset = *harness.offset_rx.borrow();

    let res = request(&harness.requests_tx, |tx| ClusterCtlMsg::Heartbeat {
        request: heartbeat(9, 0, 0, false, false),
        tx,
    })
    .await?;
    assert!(matches!(res, Err(ControllerError::StaleBrokerEpoch(_))), "expected stale broker epoch error, got {:?}", res);

    let res = request(&harness.requests_tx, |tx| ClusterCtlMsg::PlaceReplicas {
        num_partitions: 1,
        replication_factor: 1,
        tx,
    })
    .await?;
    assert!(
        matches!(res, Err(ControllerError::NotEnoughReplicas { requested: 1, available: 0 })),
        "expected not enough replicas error, got {:?}",
        res
    );
    assert!(*harness.offset_rx.borrow() == offset, "expected rejected requests to not produce records");

    harness.shutdown().await
}

#[tokio::test]
async fn place_replicas_over_unfenced_brokers() -> Result<()> {
    let harness = spawn_ctl();
    for id in 0..3 {
        harness.register_and_unfence(id).await?;
    }
    harness.register(3).await?;

    let placement = request(&harness.requests_tx, |tx| ClusterCtlMsg::PlaceReplicas {
        num_partitions: 10,
        replication_factor: 3,
        tx,
    })
    .await??;

    assert!(placement.len() == 10, "expected 10 assignments, got {}", placement.len());
    for assignment in placement {
        let mut sorted = assignment.clone();
        sorted.sort_unstable();
        assert!(sorted == vec![0, 1, 2], "expected assignment over unfenced brokers only, got {:?}", assignment);
    }

    harness.shutdown().await
}

#[tokio::test]
async fn decommission_removes_broker() -> Result<()> {
    let harness = spawn_ctl();
    harness.register_and_unfence(1).await?;

    request(&harness.requests_tx, |tx| ClusterCtlMsg::Decommission { broker_id: 1, tx }).await??;

    assert!(!harness.unfenced(1)?, "expected decommissioned broker to not be unfenced");
    let registrations = harness.view.broker_registrations_at(*harness.offset_rx.borrow())?;
    assert!(registrations.is_empty(), "expected no registrations, got {:?}", registrations);

    let epoch = harness.register(1).await?;
    assert!(epoch > 0, "expected re-registration to be assigned a new epoch, got {}", epoch);

    harness.shutdown().await
}

#[tokio::test]
async fn liveness_check_fences_expired_brokers() -> Result<()> {
    let mut harness = spawn_ctl();
    harness.register_and_unfence(1).await?;
    assert!(harness.unfenced(1)?, "expected broker 1 to be unfenced");

    harness.clock.advance(harness.config.session_timeout());
    tokio::time::timeout(TIMEOUT, async {
        loop {
            harness.offset_rx.changed().await?;
            if !harness.unfenced(1)? {
                return Ok::<_, anyhow::Error>(());
            }
        }
    })
    .await
    .context("timeout waiting for broker 1 to be fenced")??;

    let epoch = harness.view.broker_registrations_at(*harness.offset_rx.borrow())?.get(&1).map(|reg| reg.epoch);
    assert!(epoch == Some(0), "expected broker 1 to remain registered at epoch 0, got {:?}", epoch);

    harness.shutdown().await
}

#[tokio::test]
async fn only_recent_snapshots_are_retained() -> Result<()> {
    let harness = spawn_ctl();
    for id in 0..4 {
        harness.register_and_unfence(id).await?;
    }

    let snapshots = harness.view.snapshots();
    let last = *harness.offset_rx.borrow();
    assert!(
        snapshots.len() == harness.config.retained_snapshots,
        "expected {} snapshots to be retained, got {:?}",
        harness.config.retained_snapshots,
        snapshots
    );
    assert!(snapshots.last() == Some(&last), "expected the latest snapshot to be at offset {}, got {:?}", last, snapshots);
    let first = snapshots[0];
    let res = harness.view.broker_registrations_at(first - 1);
    assert!(res.is_err(), "expected reads below the retained snapshots to fail");

    harness.shutdown().await
}

#[tokio::test]
async fn controller_stops_when_request_senders_are_dropped() -> Result<()> {
    let harness = spawn_ctl();
    let Harness { requests_tx, handle, .. } = harness;

    drop(requests_tx);

    tokio::time::timeout(TIMEOUT, handle).await.context("timeout waiting for controller shutdown")??
}
