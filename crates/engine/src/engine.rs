use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use pool::{
    DeferredTasks, PoolError, PoolStats, Request, Services, SingleFlight, WorkerPool,
};
use tokio::sync::{oneshot, watch};

use crate::config::RuntimeConfig;

struct EngineInner {
    pool: WorkerPool,
    deferred: DeferredTasks,
    install: SingleFlight<bool>,
    ready: watch::Sender<bool>,
    entry: String,
}

/// Entry point for running PHP: installs the application once, holds
/// requests back until the installation is done, then hands them to the
/// worker pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: &RuntimeConfig, services: Services) -> Result<Self, PoolError> {
        let pool = WorkerPool::new(
            config.pool_config(),
            config.layout(),
            config.image_url(),
            services,
        )?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                pool,
                deferred: DeferredTasks::new(),
                install: SingleFlight::new(),
                ready: watch::Sender::new(false),
                entry: config.entry().to_string(),
            }),
        })
    }

    /// Install, start the pool, then signal readiness.
    pub async fn start(&self) -> Result<(), PoolError> {
        self.ensure_installed().await?;
        self.inner.pool.initialize().await?;
        self.inner.ready.send_replace(true);
        tracing::info!("engine ready");
        Ok(())
    }

    /// Run the installation workflow unless it already completed. Deferred
    /// work is released as soon as it succeeds.
    pub async fn ensure_installed(&self) -> Result<bool, PoolError> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .install
            .run(move || async move {
                let installed = inner.pool.install().await?;
                inner.deferred.open();
                Ok(installed)
            })
            .await
    }

    pub fn is_installed(&self) -> bool {
        self.inner.install.is_done()
    }

    /// Run `task` once installation completes, or now if it already has.
    pub fn when_installed<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.deferred.submit(task);
    }

    pub fn run(&self, path: impl Into<String>) -> BoxFuture<'static, Result<String, PoolError>> {
        self.dispatch(Request::run(path))
    }

    pub fn run_inline(
        &self,
        code: impl Into<String>,
    ) -> BoxFuture<'static, Result<String, PoolError>> {
        self.dispatch(Request::inline(code))
    }

    /// Run the configured entry script.
    pub fn run_entry(&self) -> BoxFuture<'static, Result<String, PoolError>> {
        self.run(self.inner.entry.clone())
    }

    /// Queue `request` behind installation. Requests keep their submission
    /// order across the deferral.
    pub fn dispatch(&self, request: Request) -> BoxFuture<'static, Result<String, PoolError>> {
        let (tx, rx) = oneshot::channel();
        let pool = self.inner.pool.clone();
        let deferred = self.inner.deferred.submit(move || {
            if !tx.is_closed() {
                let _ = tx.send(pool.execute(request));
            }
        });
        if deferred {
            tracing::debug!("request deferred until installation completes");
        }
        let engine = self.clone();
        async move {
            if deferred {
                engine.ensure_installed().await?;
            }
            let execution = rx.await.map_err(|_| PoolError::SchedulerGone)?;
            execution.await
        }
        .boxed()
    }

    pub fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub async fn wait_ready(&self) {
        let mut ready = self.ready();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        self.inner.pool.stats().await
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool::testing::FakeWorld;
    use std::sync::Mutex;
    use std::time::Duration;

    const APP: &[(&str, &str)] = &[
        ("index.php", "echo 'home'"),
        ("admin/report.php", "echo 'report'"),
    ];

    fn engine(world: &FakeWorld, units: usize) -> Engine {
        let config = RuntimeConfig {
            units: Some(units),
            image: Some(FakeWorld::IMAGE_URL.to_string()),
            archive: Some(FakeWorld::ARCHIVE_URL.to_string()),
            ..RuntimeConfig::default()
        };
        Engine::new(&config, world.services()).unwrap()
    }

    #[tokio::test]
    async fn test_start_installs_and_signals_ready() {
        let world = FakeWorld::new(APP);
        let engine = engine(&world, 2);
        let mut ready = engine.ready();
        assert!(!*ready.borrow());

        engine.start().await.unwrap();
        assert!(engine.is_installed());
        assert!(ready.has_changed().unwrap());
        assert!(*ready.borrow_and_update());
        engine.wait_ready().await;

        assert_eq!(engine.run_entry().await, Ok("home".to_string()));
        assert_eq!(engine.run("admin/report.php").await, Ok("report".to_string()));
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.units, 2);
        assert!(stats.ready);
        assert_eq!(world.fetcher.calls(FakeWorld::ARCHIVE_URL), 1);
    }

    #[tokio::test]
    async fn test_requests_wait_for_installation_and_keep_order() {
        let world = FakeWorld::new(APP);
        let gate = world.fetcher.hold(FakeWorld::ARCHIVE_URL);
        let engine = engine(&world, 1);

        let first = tokio::spawn(engine.run_inline("echo 'first'"));
        let second = tokio::spawn(engine.run("index.php"));
        let third = tokio::spawn(engine.run_inline("echo 'third'"));

        while world.fetcher.calls(FakeWorld::ARCHIVE_URL) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(world.probe().runs().is_empty());
        assert!(!engine.is_ready());

        gate.open();
        assert_eq!(first.await.unwrap(), Ok("first".to_string()));
        assert_eq!(second.await.unwrap(), Ok("home".to_string()));
        assert_eq!(third.await.unwrap(), Ok("third".to_string()));

        let runs = world.probe().runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0], "echo 'first'");
        assert!(runs[1].contains("require '/www/index.php';"));
        assert_eq!(runs[2], "echo 'third'");
        assert_eq!(world.fetcher.calls(FakeWorld::ARCHIVE_URL), 1);
    }

    #[tokio::test]
    async fn test_when_installed_runs_after_installation() {
        let world = FakeWorld::new(APP);
        let engine = engine(&world, 1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&log);
        engine.when_installed(move || sink.lock().unwrap().push("deferred"));
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(engine.ensure_installed().await, Ok(true));
        assert_eq!(*log.lock().unwrap(), vec!["deferred"]);

        let sink = Arc::clone(&log);
        engine.when_installed(move || sink.lock().unwrap().push("immediate"));
        assert_eq!(*log.lock().unwrap(), vec!["deferred", "immediate"]);
    }

    #[tokio::test]
    async fn test_failed_installation_can_be_retried() {
        let world = FakeWorld::new(APP);
        world
            .fetcher
            .serve_status(FakeWorld::ARCHIVE_URL, 404, "Not Found");
        let engine = engine(&world, 1);

        let err = engine.start().await.unwrap_err();
        assert_eq!(
            err,
            PoolError::Transport("could not download www.zip: 404 Not Found".to_string())
        );
        assert!(!engine.is_ready());
        assert!(!world.is_persisted("/www/INSTALLED"));
        assert_eq!(
            engine.run_entry().await,
            Err(PoolError::Transport(
                "could not download www.zip: 404 Not Found".to_string()
            ))
        );

        world
            .fetcher
            .serve(FakeWorld::ARCHIVE_URL, pool::testing::FakeDecoder::encode(APP));
        engine.start().await.unwrap();
        assert_eq!(engine.run_entry().await, Ok("home".to_string()));
        assert_eq!(world.fetcher.calls(FakeWorld::ARCHIVE_URL), 3);
    }

    #[tokio::test]
    async fn test_restart_reuses_persisted_installation() {
        let world = FakeWorld::new(APP);
        engine(&world, 1).start().await.unwrap();

        let restarted = engine(&world, 1);
        restarted.start().await.unwrap();
        assert_eq!(restarted.run_entry().await, Ok("home".to_string()));
        assert_eq!(world.fetcher.calls(FakeWorld::ARCHIVE_URL), 1);
    }
}
