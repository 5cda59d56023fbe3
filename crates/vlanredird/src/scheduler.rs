//! Fixed-interval driver of the statistics engine.
//!
//! Ticks follow an absolute schedule starting one interval after
//! [`Scheduler::run`] is called; a tick that overruns skips the missed
//! deadlines instead of bursting. Each tick holds the state lock for the
//! whole sampling pass and publishes a [`Snapshot`] on a watch channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::link::LinkControl;
use crate::sampler::{entity_label, StatisticsEngine};
use crate::snapshot::Snapshot;
use crate::state::SharedState;

pub struct Scheduler {
    interval: Duration,
    engine: StatisticsEngine,
    snapshots: watch::Sender<Snapshot>,
}

impl Scheduler {
    pub fn new(interval: Duration, engine: StatisticsEngine) -> Self {
        let (snapshots, _) = watch::channel(Snapshot::default());
        Scheduler {
            interval,
            engine,
            snapshots,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Receiver of the snapshot published after every successful tick.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// Runs one sampling pass under the state lock.
    pub async fn tick(
        &self,
        state: &SharedState,
        link: &dyn LinkControl,
        tick: u64,
    ) -> Result<Snapshot> {
        let mut guard = state.lock().await;
        let rescaled = self.engine.sample(&mut guard, link).await?;
        for entity in &rescaled {
            debug!(entity = %entity_label(&guard.topology, *entity), "Chart scale changed");
        }
        Ok(Snapshot::capture(
            tick,
            &guard.topology,
            guard.selector,
            rescaled,
        ))
    }

    /// Ticks until `shutdown` resolves or a pass fails. Returns the number
    /// of completed ticks.
    pub async fn run<F>(
        &self,
        state: SharedState,
        link: Arc<dyn LinkControl>,
        shutdown: F,
    ) -> Result<u64>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_ms = self.interval.as_millis() as u64, "Sampling started");
        let mut ticks = 0u64;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(ticks, "Sampling stopped");
                    return Ok(ticks);
                }
                _ = ticker.tick() => {
                    let snapshot = match self.tick(&state, link.as_ref(), ticks + 1).await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            error!(tick = ticks + 1, error = %e, "Sampling failed");
                            return Err(e);
                        }
                    };
                    ticks += 1;
                    debug!(tick = ticks, summary = %snapshot.summary(), "Tick");
                    self.snapshots.send_replace(snapshot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, TopologyFile};
    use crate::error::VlanRedirError;
    use crate::state::AppState;
    use crate::testing::{FakeEngineLoader, FakeKernel, FakeLink};
    use crate::topology::EntityRef;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    async fn shared_state(link: &FakeLink) -> SharedState {
        let desc = TopologyFile::from_json(
            r#"{ "interfaces": { "eth0": { "redirect_map": { "10": "eth2" } } } }"#,
        )
        .unwrap()
        .validate()
        .unwrap();
        let mut engines = FakeEngineLoader::new(FakeKernel::default());
        AppState::bootstrap(&desc, Settings::default(), link, &mut engines)
            .await
            .unwrap()
            .into_shared()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval_until_shutdown() {
        let link = Arc::new(FakeLink::with_interfaces(&[("eth0", 2), ("eth2", 7)]));
        let state = shared_state(&link).await;
        let scheduler = Arc::new(Scheduler::new(
            Duration::from_millis(1000),
            StatisticsEngine::new(7),
        ));
        let mut snapshots = scheduler.subscribe();
        let (stop, stopped) = oneshot::channel::<()>();

        let runner = {
            let scheduler = scheduler.clone();
            let state = state.clone();
            let link: Arc<dyn LinkControl> = link.clone();
            tokio::spawn(async move {
                scheduler
                    .run(state, link, async {
                        let _ = stopped.await;
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(3500)).await;
        snapshots.changed().await.unwrap();
        assert_eq!(snapshots.borrow().tick, 3);

        stop.send(()).unwrap();
        assert_eq!(runner.await.unwrap().unwrap(), 3);

        let guard = state.lock().await;
        assert_eq!(guard.topology.input(2).unwrap().history.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_before_first_interval() {
        let link = Arc::new(FakeLink::with_interfaces(&[("eth0", 2), ("eth2", 7)]));
        let state = shared_state(&link).await;
        let scheduler = Scheduler::new(Duration::from_secs(1), StatisticsEngine::new(7));

        let ticks = scheduler
            .run(state.clone(), link, tokio::time::sleep(Duration::from_millis(999)))
            .await
            .unwrap();
        assert_eq!(ticks, 0);
        assert_eq!(state.lock().await.topology.input(2).unwrap().history.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_failure_stops_run() {
        let link = Arc::new(FakeLink::with_interfaces(&[("eth0", 2), ("eth2", 7)]));
        let state = shared_state(&link).await;
        link.fail_counters(2);
        let scheduler = Scheduler::new(Duration::from_secs(1), StatisticsEngine::new(7));

        let err = scheduler
            .run(state, link, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, VlanRedirError::SamplingFailed { .. }));
    }

    #[tokio::test]
    async fn test_tick_snapshot_carries_selection() {
        let link = FakeLink::with_interfaces(&[("eth0", 2), ("eth2", 7)]);
        let state = shared_state(&link).await;
        let scheduler = Scheduler::new(Duration::from_secs(1), StatisticsEngine::new(7));

        let snapshot = scheduler.tick(&state, &link, 1).await.unwrap();
        assert_eq!(snapshot.tick, 1);
        assert_eq!(snapshot.entities.len(), 3);
        assert_eq!(
            snapshot.selector.unwrap().selected,
            EntityRef::Input { ifindex: 2 }
        );
    }
}
