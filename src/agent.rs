//! Wires the synchronization and telemetry tasks for a run mode.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    config::AgentConfig,
    fetcher::{HttpFetcher, SegmentFetcher, SplitFetcher},
    http::HttpClientConfig,
    listener::{
        HttpImpressionListener, ImpressionListener, ListenerForwarder, ListenerQueue,
        LISTENER_BATCHES_PER_TICK,
    },
    recorder::{
        HttpRecorder, ImpressionsRecorder, ImpressionsRecorderTask, MetricsRecorder,
        MetricsRecorderTask,
    },
    scheduler::Scheduler,
    storage::{local::LocalStorage, redis::RedisStorage, Storage},
    synchronizer::{SegmentTaskArena, SplitSynchronizer},
    Result,
};

/// Name of the split synchronization task.
pub const SPLITS_TASK: &str = "splits";
/// Name of the metrics recorder task.
pub const METRICS_TASK: &str = "metrics";
/// Name of the impression listener forwarder task.
pub const LISTENER_TASK: &str = "impression-listener";

/// How the agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Writes into the shared store and relays telemetry buffered there by SDKs.
    Producer,
    /// Keeps an embedded store in sync for an SDK-facing HTTP layer running in the same process.
    Proxy,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Producer => "producer",
            Mode::Proxy => "proxy",
        })
    }
}

/// Everything the tasks talk to.
pub struct Collaborators {
    #[allow(missing_docs)]
    pub storage: Arc<dyn Storage>,
    #[allow(missing_docs)]
    pub split_fetcher: Arc<dyn SplitFetcher>,
    #[allow(missing_docs)]
    pub segment_fetcher: Arc<dyn SegmentFetcher>,
    #[allow(missing_docs)]
    pub impressions_recorder: Arc<dyn ImpressionsRecorder>,
    #[allow(missing_docs)]
    pub metrics_recorder: Arc<dyn MetricsRecorder>,
    /// Receives a copy of every impression batch, if configured.
    pub impression_listener: Option<Arc<dyn ImpressionListener>>,
}

impl Collaborators {
    /// Build HTTP clients for the central service and the storage backend of `mode`: Redis for
    /// [`Mode::Producer`], the embedded store for [`Mode::Proxy`].
    pub fn from_config(mode: Mode, config: &AgentConfig) -> Result<Collaborators> {
        let client_config = |base_url: &str| HttpClientConfig {
            base_url: base_url.to_owned(),
            api_key: config.api_key.clone(),
            timeout: config.http_timeout,
            metadata: HttpClientConfig::agent_metadata(),
        };
        let fetcher = Arc::new(HttpFetcher::new(client_config(&config.sdk_url))?);
        let recorder = Arc::new(HttpRecorder::new(client_config(&config.events_url))?);

        let storage: Arc<dyn Storage> = match mode {
            Mode::Producer => Arc::new(RedisStorage::new(&config.redis)?),
            Mode::Proxy => match config.proxy.persist_path() {
                Some(path) => Arc::new(LocalStorage::open(path)?),
                None => Arc::new(LocalStorage::in_memory()),
            },
        };

        let impression_listener = match config.impression_listener.endpoint() {
            Some(endpoint) => Some(Arc::new(HttpImpressionListener::new(
                endpoint,
                config.http_timeout,
            )?) as Arc<dyn ImpressionListener>),
            None => None,
        };

        Ok(Collaborators {
            storage,
            split_fetcher: fetcher.clone(),
            segment_fetcher: fetcher,
            impressions_recorder: recorder.clone(),
            metrics_recorder: recorder,
            impression_listener,
        })
    }
}

/// A running agent.
///
/// Tasks keep running until [`Agent::shutdown`] is called.
pub struct Agent {
    mode: Mode,
    scheduler: Arc<Scheduler>,
    storage: Arc<dyn Storage>,
    segments: Arc<SegmentTaskArena>,
    listener_queue: Option<ListenerQueue>,
    started_at: DateTime<Utc>,
}

impl Agent {
    /// Schedule every task of `mode`. The first tick of each task runs right away.
    ///
    /// Producer mode runs `splits`, one `segment:{name}` task per referenced segment,
    /// `impressions:{i}` for each configured recorder thread, `metrics`, and `impression-listener`
    /// when a listener is configured. Proxy mode runs only the split, segment and listener tasks;
    /// telemetry is accepted by the SDK-facing layer, which feeds [`Agent::listener_queue`].
    ///
    /// # Errors
    ///
    /// If a task cannot be started, tasks started so far are stopped and the error is returned.
    pub fn start(mode: Mode, config: &AgentConfig, collaborators: Collaborators) -> Result<Agent> {
        let scheduler = Arc::new(Scheduler::with_jitter(config.task_jitter));
        let segments = Arc::new(SegmentTaskArena::new(
            scheduler.clone(),
            collaborators.segment_fetcher.clone(),
            collaborators.storage.clone(),
            config.segments_refresh_rate,
        ));

        let agent = Agent {
            mode,
            scheduler,
            storage: collaborators.storage.clone(),
            segments,
            listener_queue: None,
            started_at: Utc::now(),
        };
        match agent.schedule_tasks(config, collaborators) {
            Ok(agent) => {
                log::info!(target: "split_sync", mode:% = mode, tasks:? = agent.scheduler.task_names(); "agent started");
                Ok(agent)
            }
            Err((agent, err)) => {
                if let Err(shutdown_err) = agent.shutdown() {
                    log::error!(target: "split_sync", "failed to stop tasks: {shutdown_err}");
                }
                Err(err)
            }
        }
    }

    fn schedule_tasks(
        mut self,
        config: &AgentConfig,
        collaborators: Collaborators,
    ) -> std::result::Result<Agent, (Agent, crate::Error)> {
        macro_rules! try_schedule {
            ($result:expr) => {
                let result = $result;
                if let Err(err) = result {
                    return Err((self, err));
                }
            };
        }

        if let Some(listener) = collaborators.impression_listener {
            let (queue, receiver) = ListenerQueue::bounded(config.impression_listener.queue_size);
            let forwarder = ListenerForwarder::new(receiver, listener, LISTENER_BATCHES_PER_TICK);
            try_schedule!(self.scheduler.schedule(
                LISTENER_TASK,
                config.impressions_refresh_rate,
                move || {
                    forwarder.forward();
                    Ok(())
                }
            ));
            self.listener_queue = Some(queue);
        }

        let synchronizer =
            SplitSynchronizer::new(collaborators.split_fetcher, collaborators.storage.clone());
        let storage = collaborators.storage.clone();
        let segments = self.segments.clone();
        try_schedule!(self
            .scheduler
            .schedule(SPLITS_TASK, config.splits_refresh_rate, move || {
                // Segments are reconciled even if the fetch failed, so that segments of
                // previously stored splits are kept in sync.
                let synchronized = synchronizer.synchronize().map(|_| ());
                let reconciled = storage
                    .segment_names()
                    .and_then(|names| segments.reconcile(&names));
                synchronized.and(reconciled)
            }));

        if self.mode == Mode::Producer {
            for id in 0..config.impressions_threads {
                let task = ImpressionsRecorderTask::new(
                    id,
                    collaborators.storage.clone(),
                    collaborators.impressions_recorder.clone(),
                    self.listener_queue.clone(),
                    config.impressions_per_post,
                );
                try_schedule!(self.scheduler.schedule(
                    impressions_task(id),
                    config.impressions_refresh_rate,
                    move || task.record().map(|_| ())
                ));
            }

            let task = MetricsRecorderTask::new(
                collaborators.storage.clone(),
                collaborators.metrics_recorder,
                config.metrics_per_post,
            );
            try_schedule!(self.scheduler.schedule(
                METRICS_TASK,
                config.metrics_refresh_rate,
                move || task.record().map(|_| ())
            ));
        }

        Ok(self)
    }

    #[allow(missing_docs)]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The store the tasks write to.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Queue feeding the impression listener, if one is configured. Meant for the SDK-facing
    /// layer in proxy mode.
    pub fn listener_queue(&self) -> Option<&ListenerQueue> {
        self.listener_queue.as_ref()
    }

    #[allow(missing_docs)]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Segments that currently have a synchronization task.
    pub fn tracked_segments(&self) -> Vec<String> {
        self.segments.tracked()
    }

    /// Time since the agent started, formatted as `1d 2h 3m 4s`.
    pub fn uptime(&self) -> String {
        format_uptime(Utc::now() - self.started_at)
    }

    /// Stop every task and wait for in-flight ticks to complete.
    pub fn shutdown(&self) -> Result<()> {
        log::info!(target: "split_sync", uptime = self.uptime().as_str(); "stopping agent");
        self.scheduler.shutdown()
    }
}

/// Name of impressions recorder task `id`.
pub fn impressions_task(id: usize) -> String {
    format!("impressions:{id}")
}

fn format_uptime(elapsed: chrono::Duration) -> String {
    let elapsed = elapsed.to_std().unwrap_or(Duration::ZERO).as_secs();
    let (days, rest) = (elapsed / 86_400, elapsed % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    format!("{days}d {hours}h {minutes}m {seconds}s")
}
