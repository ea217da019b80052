// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Orchestrator
//!
//! Runs one workload: provision the topology, start the producers, wait the
//! warm-up delay, start the consumers, then wait for every worker to finish.
//!
//! Provisioning must succeed before any worker is started. The warm-up delay only
//! orders producers before consumers; the durable queue would hold the messages
//! either way. Workers fail independently: one worker's error is logged and
//! counted as soon as it ends, and never stops its siblings.

use crate::{
    config::Settings,
    connection::{BrokerEndpoint, ConnectionBuilder, Connector, LapinConnector, RetryPolicy},
    consumer::ConsumerHandler,
    dispatcher::run_consumer,
    errors::AmqpError,
    producer::run_producer,
    topology::{provision, TopologyPlan},
};
use async_trait::async_trait;
use lapin::Connection;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::{JoinError, JoinSet},
};
use tracing::{error, info, warn};

type WorkerResult = (Role, usize, Result<u64, AmqpError>);

/// Worker counts and pacing for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    pub producer_count: usize,
    pub consumer_count: usize,
    pub warmup_delay: Duration,
    pub messages_per_producer: u64,
}

impl From<&Settings> for Workload {
    fn from(settings: &Settings) -> Self {
        Workload {
            producer_count: settings.workload.producer_count,
            consumer_count: settings.workload.consumer_count,
            warmup_delay: settings.workload.warmup_delay(),
            messages_per_producer: settings.workload.messages_per_producer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

/// Counts of a run, updated each time a worker ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub published: u64,
    pub acknowledged: u64,
    pub failed_workers: usize,
    pub consumers_started: bool,
}

impl RunSummary {
    fn record(&mut self, joined: Result<WorkerResult, JoinError>) {
        match joined {
            Ok((role, id, Ok(count))) => {
                info!(worker = id, role = role.as_str(), count, "worker finished");
                match role {
                    Role::Producer => self.published += count,
                    Role::Consumer => self.acknowledged += count,
                }
            }
            Ok((role, id, Err(err))) => {
                error!(
                    error = err.to_string(),
                    worker = id,
                    role = role.as_str(),
                    "worker failed"
                );
                self.failed_workers += 1;
            }
            Err(err) => {
                error!(error = err.to_string(), "worker task aborted");
                self.failed_workers += 1;
            }
        }
    }
}

/// The steps a run is made of.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Workers: Send + Sync + 'static {
    async fn provision(&self) -> Result<(), AmqpError>;

    async fn produce(
        &self,
        id: usize,
        count: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Result<u64, AmqpError>;

    async fn consume(&self, id: usize, shutdown: watch::Receiver<bool>) -> Result<u64, AmqpError>;
}

/// [`Workers`] that talk to a broker, each on its own connection.
pub struct BrokerWorkers<C> {
    builder: ConnectionBuilder<C>,
    endpoint: BrokerEndpoint,
    plan: TopologyPlan,
    handler: Arc<dyn ConsumerHandler>,
}

impl<C> BrokerWorkers<C> {
    pub fn new(
        builder: ConnectionBuilder<C>,
        endpoint: BrokerEndpoint,
        plan: TopologyPlan,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        BrokerWorkers {
            builder,
            endpoint,
            plan,
            handler,
        }
    }
}

#[async_trait]
impl<C> Workers for BrokerWorkers<C>
where
    C: Connector<Connection = Connection> + 'static,
{
    async fn provision(&self) -> Result<(), AmqpError> {
        provision(&self.builder, &self.endpoint, &self.plan).await
    }

    async fn produce(
        &self,
        id: usize,
        count: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Result<u64, AmqpError> {
        run_producer(id, &self.builder, &self.endpoint, &self.plan, count, shutdown).await
    }

    async fn consume(&self, id: usize, shutdown: watch::Receiver<bool>) -> Result<u64, AmqpError> {
        run_consumer(
            id,
            &self.builder,
            &self.endpoint,
            &self.plan,
            self.handler.clone(),
            shutdown,
        )
        .await
    }
}

pub struct Orchestrator<W> {
    workers: Arc<W>,
    workload: Workload,
    progress: watch::Sender<RunSummary>,
}

impl Orchestrator<BrokerWorkers<LapinConnector>> {
    pub fn new(settings: &Settings, handler: Arc<dyn ConsumerHandler>) -> Self {
        let policy = RetryPolicy::new(
            settings.retry.max_retries,
            Duration::from_secs(settings.retry.backoff_step_secs),
        );
        let workers = BrokerWorkers::new(
            ConnectionBuilder::new(LapinConnector::new(&settings.app.name), policy),
            settings.rabbitmq.endpoint(),
            TopologyPlan::from(&settings.topology),
            handler,
        );

        Orchestrator::with_workers(workers, Workload::from(settings))
    }
}

impl<W: Workers> Orchestrator<W> {
    pub fn with_workers(workers: W, workload: Workload) -> Self {
        let (progress, _) = watch::channel(RunSummary::default());

        Orchestrator {
            workers: Arc::new(workers),
            workload,
            progress,
        }
    }

    /// Follows the [`RunSummary`] while the run is in progress.
    pub fn progress(&self) -> watch::Receiver<RunSummary> {
        self.progress.subscribe()
    }

    /// Executes the whole run.
    ///
    /// # Errors
    /// Only provisioning failures are returned; worker failures are reported in
    /// the [`RunSummary`].
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<RunSummary, AmqpError> {
        self.workers.provision().await?;

        let mut summary = RunSummary::default();
        let mut running = JoinSet::new();

        for id in 1..=self.workload.producer_count {
            self.spawn(&mut running, Role::Producer, id, &shutdown);
        }
        info!(count = self.workload.producer_count, "producers started");

        let warmup = wait_warmup(self.workload.warmup_delay, shutdown.clone());
        tokio::pin!(warmup);

        // Producers that end during the warm-up are reported right away.
        let warmed_up = loop {
            tokio::select! {
                ready = &mut warmup => break ready,
                Some(joined) = running.join_next() => self.record(&mut summary, joined),
            }
        };

        if warmed_up {
            for id in 1..=self.workload.consumer_count {
                self.spawn(&mut running, Role::Consumer, id, &shutdown);
            }
            summary.consumers_started = true;
            self.progress.send_replace(summary);
            info!(count = self.workload.consumer_count, "consumers started");
        } else {
            warn!("shutdown requested during warm-up, consumers not started");
        }

        while let Some(joined) = running.join_next().await {
            self.record(&mut summary, joined);
        }

        info!(
            published = summary.published,
            acknowledged = summary.acknowledged,
            failed_workers = summary.failed_workers,
            "workload finished"
        );

        Ok(summary)
    }

    fn spawn(
        &self,
        running: &mut JoinSet<WorkerResult>,
        role: Role,
        id: usize,
        shutdown: &watch::Receiver<bool>,
    ) {
        let workers = self.workers.clone();
        let shutdown = shutdown.clone();
        let count = self.workload.messages_per_producer;

        running.spawn(async move {
            let result = match role {
                Role::Producer => workers.produce(id, count, shutdown).await,
                Role::Consumer => workers.consume(id, shutdown).await,
            };
            (role, id, result)
        });
    }

    fn record(&self, summary: &mut RunSummary, joined: Result<WorkerResult, JoinError>) {
        summary.record(joined);
        self.progress.send_replace(*summary);
    }
}

/// Sleeps for `delay` unless shutdown is requested first.
///
/// Returns `true` when the full delay elapsed.
pub async fn wait_warmup(delay: Duration, mut shutdown: watch::Receiver<bool>) -> bool {
    let stop = *shutdown.borrow_and_update();
    if stop {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Nobody can request shutdown anymore.
                    sleep.as_mut().await;
                    return true;
                }
                let stop = *shutdown.borrow_and_update();
                if stop {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_warmup_waits_full_delay() {
        let (_tx, rx) = watch::channel(false);
        let started = Instant::now();

        assert!(wait_warmup(Duration::from_secs(30), rx).await);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_interrupted_by_shutdown() {
        let (tx, rx) = watch::channel(false);
        let started = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            tx.send(true).unwrap();
        });

        assert!(!wait_warmup(Duration::from_secs(30), rx).await);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_skipped_when_already_shutting_down() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        assert!(!wait_warmup(Duration::from_secs(30), rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_survives_dropped_sender() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let started = Instant::now();

        assert!(wait_warmup(Duration::from_secs(3), rx).await);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_workload_from_default_settings() {
        let workload = Workload::from(&Settings::default());

        assert_eq!(
            workload,
            Workload {
                producer_count: 2,
                consumer_count: 10,
                warmup_delay: Duration::from_secs(30),
                messages_per_producer: 499_999,
            }
        );
    }

    #[test]
    fn test_summary_counts_failures_without_stopping() {
        let mut summary = RunSummary::default();

        summary.record(Ok((Role::Producer, 1, Ok(10))));
        summary.record(Ok((Role::Producer, 2, Err(AmqpError::PublishingError(3)))));
        summary.record(Ok((Role::Consumer, 1, Ok(7))));

        assert_eq!(summary.published, 10);
        assert_eq!(summary.acknowledged, 7);
        assert_eq!(summary.failed_workers, 1);
    }

    fn workload() -> Workload {
        Workload {
            producer_count: 2,
            consumer_count: 3,
            warmup_delay: Duration::from_secs(30),
            messages_per_producer: 5,
        }
    }

    /// What the scripted workers did, and when.
    struct WorkerLog {
        started: Instant,
        events: Mutex<Vec<(Duration, String)>>,
        active_consumers: AtomicUsize,
    }

    impl WorkerLog {
        fn push(&self, event: String) {
            self.events
                .lock()
                .unwrap()
                .push((self.started.elapsed(), event));
        }

        fn events(&self) -> Vec<(Duration, String)> {
            self.events.lock().unwrap().clone()
        }
    }

    /// Producers return at once, except `failing_producer` which fails after
    /// 40s. Consumers run until shutdown.
    struct ScriptedWorkers {
        log: Arc<WorkerLog>,
        failing_producer: Option<usize>,
    }

    impl ScriptedWorkers {
        fn new(failing_producer: Option<usize>) -> (Self, Arc<WorkerLog>) {
            let log = Arc::new(WorkerLog {
                started: Instant::now(),
                events: Mutex::new(Vec::new()),
                active_consumers: AtomicUsize::new(0),
            });
            let workers = ScriptedWorkers {
                log: log.clone(),
                failing_producer,
            };
            (workers, log)
        }
    }

    #[async_trait]
    impl Workers for ScriptedWorkers {
        async fn provision(&self) -> Result<(), AmqpError> {
            self.log.push("provision".to_owned());
            Ok(())
        }

        async fn produce(
            &self,
            id: usize,
            count: u64,
            _shutdown: watch::Receiver<bool>,
        ) -> Result<u64, AmqpError> {
            self.log.push(format!("producer {id}"));
            if self.failing_producer == Some(id) {
                tokio::time::sleep(Duration::from_secs(40)).await;
                return Err(AmqpError::PublishingError(4));
            }
            Ok(count)
        }

        async fn consume(
            &self,
            id: usize,
            mut shutdown: watch::Receiver<bool>,
        ) -> Result<u64, AmqpError> {
            self.log.push(format!("consumer {id}"));
            self.log.active_consumers.fetch_add(1, Ordering::SeqCst);
            loop {
                let stop = *shutdown.borrow_and_update();
                if stop || shutdown.changed().await.is_err() {
                    break;
                }
            }
            self.log.active_consumers.fetch_sub(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_failure_starts_no_worker() {
        let mut workers = MockWorkers::new();
        workers
            .expect_provision()
            .times(1)
            .returning(|| Err(AmqpError::DeclareQueueError("queue1_work".to_owned())));
        workers.expect_produce().never();
        workers.expect_consume().never();
        let (_tx, rx) = watch::channel(false);

        let orchestrator = Orchestrator::with_workers(workers, workload());

        assert_eq!(
            orchestrator.run(rx).await,
            Err(AmqpError::DeclareQueueError("queue1_work".to_owned()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_producers_start_before_warmup_and_consumers_after() {
        let (workers, log) = ScriptedWorkers::new(None);
        let orchestrator = Arc::new(Orchestrator::with_workers(workers, workload()));
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run(rx).await }
        });
        tokio::time::sleep(Duration::from_secs(45)).await;
        tx.send(true).unwrap();
        let summary = run.await.unwrap().unwrap();

        let events = log.events();
        let zero = Duration::ZERO;
        let warm = Duration::from_secs(30);
        assert_eq!(events[0], (zero, "provision".to_owned()));

        let mut started = events[1..].to_vec();
        started.sort();
        assert_eq!(
            started,
            vec![
                (zero, "producer 1".to_owned()),
                (zero, "producer 2".to_owned()),
                (warm, "consumer 1".to_owned()),
                (warm, "consumer 2".to_owned()),
                (warm, "consumer 3".to_owned()),
            ]
        );
        assert_eq!(
            summary,
            RunSummary {
                published: 10,
                acknowledged: 3,
                failed_workers: 0,
                consumers_started: true,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_producer_is_reported_while_consumers_run() {
        let (workers, log) = ScriptedWorkers::new(Some(2));
        let orchestrator = Arc::new(Orchestrator::with_workers(workers, workload()));
        let mut progress = orchestrator.progress();
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run(rx).await }
        });

        let reported = *progress
            .wait_for(|summary| summary.failed_workers == 1)
            .await
            .unwrap();
        assert_eq!(log.active_consumers.load(Ordering::SeqCst), 3);
        assert!(reported.consumers_started);
        assert_eq!(reported.published, 5);
        assert_eq!(reported.acknowledged, 0);

        tx.send(true).unwrap();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.failed_workers, 1);
        assert_eq!(summary.acknowledged, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_failure_during_warmup_is_reported_before_consumers() {
        let mut workers = MockWorkers::new();
        workers.expect_provision().returning(|| Ok(()));
        workers
            .expect_produce()
            .times(2)
            .returning(|id, _, _| Err(AmqpError::RetryExhausted { attempts: id as u32 }));
        workers.expect_consume().never();
        let orchestrator = Arc::new(Orchestrator::with_workers(workers, workload()));
        let mut progress = orchestrator.progress();
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run(rx).await }
        });

        let reported = *progress
            .wait_for(|summary| summary.failed_workers == 2)
            .await
            .unwrap();
        assert!(!reported.consumers_started);

        // Shutdown during the warm-up skips the consumers.
        tx.send(true).unwrap();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.failed_workers, 2);
        assert!(!summary.consumers_started);
    }
}
