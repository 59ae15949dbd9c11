//! The worker pool: a scheduler actor on a dedicated thread plus the
//! execution units it dispatches to.

use std::sync::Arc;
use std::thread;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all, try_join_all};
use tokio::sync::{mpsc, oneshot};

use crate::bootstrap::BootstrapUnit;
use crate::config::{InstallLayout, PoolConfig};
use crate::error::PoolError;
use crate::flight::SingleFlight;
use crate::image::ImageLoader;
use crate::protocol::{ReplyBody, Request, UnitId, UnitMessage, UnitReply};
use crate::scheduler::{CallerReply, DirectReply, DirectRequest, PoolStats, Scheduler};
use crate::services::Services;
use crate::unit::{UnitHandle, spawn_unit};

enum PoolCommand {
    Submit {
        request: Request,
        reply: CallerReply,
    },
    Register {
        units: Vec<UnitHandle>,
    },
    Direct {
        unit: usize,
        request: DirectRequest,
        reply: DirectReply,
    },
    Ready,
    InitFailed(PoolError),
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
}

struct PoolInner {
    config: PoolConfig,
    layout: InstallLayout,
    services: Services,
    image: ImageLoader,
    commands: mpsc::UnboundedSender<PoolCommand>,
    replies: mpsc::UnboundedSender<UnitReply>,
    init: SingleFlight<()>,
}

/// Runs requests on a fixed set of execution units. Units are started
/// lazily by the first `execute` call; requests are admitted in submission
/// order as units become free.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        layout: InstallLayout,
        image_url: impl Into<String>,
        services: Services,
    ) -> Result<Self, PoolError> {
        if config.num_units == 0 {
            return Err(PoolError::InvalidRequest(
                "worker pool needs at least one unit".to_string(),
            ));
        }
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (replies, reply_rx) = mpsc::unbounded_channel();
        let debug = config.debug;
        thread::Builder::new()
            .name("phpw-scheduler".to_string())
            .spawn(move || run_scheduler(debug, command_rx, reply_rx))
            .map_err(|err| {
                tracing::error!("failed to start scheduler thread: {}", err);
                PoolError::Runtime(format!("failed to start scheduler thread: {err}"))
            })?;

        tracing::info!(
            "worker pool created: {} units, doc root {}",
            config.num_units,
            layout.doc_root
        );
        let image = ImageLoader::new(image_url, Arc::clone(&services.fetcher));
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                layout,
                services,
                image,
                commands,
                replies,
                init: SingleFlight::new(),
            }),
        })
    }

    /// Queue `request` and resolve with its output. The request joins the
    /// queue before this returns, so admission follows call order.
    pub fn execute(&self, request: Request) -> BoxFuture<'static, Result<String, PoolError>> {
        let (reply, rx) = oneshot::channel();
        let submitted = self.inner.send(PoolCommand::Submit { request, reply });
        let inner = Arc::clone(&self.inner);
        async move {
            submitted?;
            inner.ensure_initialized().await?;
            rx.await.map_err(|_| PoolError::SchedulerGone)?
        }
        .boxed()
    }

    /// Start the units now instead of on first use.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        Arc::clone(&self.inner).ensure_initialized().await
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.init.is_done()
    }

    /// Run the installation workflow on a short-lived unit of its own.
    pub async fn install(&self) -> Result<bool, PoolError> {
        let image = self.inner.image.acquire().await?;
        let unit = BootstrapUnit::start(
            image.copy_for_unit(),
            self.inner.services.clone(),
            self.inner.layout.clone(),
        )?;
        drop(image);
        unit.install(self.inner.config.debug).await
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.inner.send(PoolCommand::Stats { reply })?;
        rx.await.map_err(|_| PoolError::SchedulerGone)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.inner.layout
    }
}

impl PoolInner {
    fn send(&self, command: PoolCommand) -> Result<(), PoolError> {
        self.commands
            .send(command)
            .map_err(|_| PoolError::SchedulerGone)
    }

    async fn ensure_initialized(self: Arc<Self>) -> Result<(), PoolError> {
        let inner = Arc::clone(&self);
        self.init.run(move || inner.initialize()).await
    }

    async fn initialize(self: Arc<Self>) -> Result<(), PoolError> {
        let outcome = self.start_units().await;
        if let Err(err) = &outcome {
            tracing::warn!("worker pool failed to start: {}", err);
            let _ = self.send(PoolCommand::InitFailed(err.clone()));
        }
        outcome
    }

    async fn start_units(&self) -> Result<(), PoolError> {
        let count = self.config.num_units;
        let image = self.image.acquire().await?;
        let mut units = Vec::with_capacity(count);
        for index in 0..count {
            let unit = spawn_unit(
                UnitId::numbered(index),
                self.services.clone(),
                self.layout.clone(),
                self.replies.clone(),
            )?;
            unit.send(UnitMessage::LoadImage(image.copy_for_unit()))?;
            units.push(unit);
        }
        drop(image);
        self.image.release().await;
        self.send(PoolCommand::Register { units })?;

        try_join_all((0..count).map(|unit| self.direct(unit, DirectRequest::Configure))).await?;

        if let Some(script) = &self.config.warm_up_script {
            let warm_ups = (0..count)
                .map(|unit| self.direct(unit, DirectRequest::RunInline(script.clone())));
            for (unit, outcome) in join_all(warm_ups).await.into_iter().enumerate() {
                if let Err(err) = outcome {
                    tracing::warn!("warm-up failed on {}: {}", UnitId::numbered(unit), err);
                }
            }
        }

        self.send(PoolCommand::Ready)?;
        tracing::info!("worker pool ready: {} units", count);
        Ok(())
    }

    async fn direct(&self, unit: usize, request: DirectRequest) -> Result<ReplyBody, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::Direct {
            unit,
            request,
            reply,
        })?;
        rx.await.map_err(|_| PoolError::SchedulerGone)?
    }
}

/// Scheduler actor loop. Exits when every pool handle is dropped, which
/// drops the units and lets their threads finish.
fn run_scheduler(
    debug: bool,
    mut commands: mpsc::UnboundedReceiver<PoolCommand>,
    mut replies: mpsc::UnboundedReceiver<UnitReply>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!("scheduler could not create its runtime: {}", err);
            return;
        }
    };

    let mut scheduler = Scheduler::<UnitHandle>::new(debug);
    rt.block_on(async {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => handle_command(&mut scheduler, command),
                    None => break,
                },
                Some(reply) = replies.recv() => scheduler.complete(reply),
            }
        }
    });
    tracing::debug!("scheduler shutting down");
}

fn handle_command(scheduler: &mut Scheduler<UnitHandle>, command: PoolCommand) {
    match command {
        PoolCommand::Submit { request, reply } => scheduler.enqueue(request, reply),
        PoolCommand::Register { units } => scheduler.register(units),
        PoolCommand::Direct {
            unit,
            request,
            reply,
        } => scheduler.direct(unit, request, reply),
        PoolCommand::Ready => scheduler.mark_ready(),
        PoolCommand::InitFailed(err) => scheduler.fail_queued(err),
        PoolCommand::Stats { reply } => {
            let _ = reply.send(scheduler.stats());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeWorld;
    use std::time::Duration;

    fn pool(world: &FakeWorld, units: usize, warm_up: Option<&str>) -> WorkerPool {
        let config = PoolConfig {
            num_units: units,
            debug: false,
            warm_up_script: warm_up.map(str::to_string),
        };
        WorkerPool::new(
            config,
            InstallLayout::default(),
            FakeWorld::IMAGE_URL,
            world.services(),
        )
        .unwrap()
    }

    async fn wait_for_stats(pool: &WorkerPool, check: impl Fn(&PoolStats) -> bool) -> PoolStats {
        for _ in 0..500 {
            let stats = pool.stats().await.unwrap();
            if check(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached the expected state");
    }

    #[tokio::test]
    async fn test_zero_units_is_rejected() {
        let world = FakeWorld::new(&[]);
        let config = PoolConfig {
            num_units: 0,
            debug: false,
            warm_up_script: None,
        };
        let created = WorkerPool::new(
            config,
            InstallLayout::default(),
            FakeWorld::IMAGE_URL,
            world.services(),
        );
        assert!(matches!(created, Err(PoolError::InvalidRequest(_))));
        assert_eq!(world.fetcher.calls(FakeWorld::IMAGE_URL), 0);
    }

    #[tokio::test]
    async fn test_units_start_lazily_and_share_one_image_fetch() {
        let world = FakeWorld::new(&[]);
        let pool = pool(&world, 3, None);
        assert_eq!(world.fetcher.calls(FakeWorld::IMAGE_URL), 0);
        assert!(!pool.stats().await.unwrap().ready);

        assert_eq!(
            pool.execute(Request::inline("echo 'hi'")).await,
            Ok("hi".to_string())
        );
        assert_eq!(world.fetcher.calls(FakeWorld::IMAGE_URL), 1);
        assert_eq!(world.probe().instances(), 3);
        assert_eq!(world.probe().images().len(), 3);
        assert!(pool.is_initialized());

        pool.execute(Request::inline("echo 'again'")).await.unwrap();
        assert_eq!(world.fetcher.calls(FakeWorld::IMAGE_URL), 1);
    }

    #[tokio::test]
    async fn test_two_units_three_requests() {
        let world = FakeWorld::new(&[]);
        let probe = world.probe();
        let pool = pool(&world, 2, None);

        let first = tokio::spawn(pool.execute(Request::inline("wait 'one'\necho 'r1'")));
        let second = tokio::spawn(pool.execute(Request::inline("wait 'two'\necho 'r2'")));
        let third = tokio::spawn(pool.execute(Request::inline("echo 'r3'")));

        let stats = wait_for_stats(&pool, |stats| stats.ready && stats.in_flight == 2).await;
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.available, 0);

        probe.gate("two").open();
        assert_eq!(second.await.unwrap(), Ok("r2".to_string()));
        assert_eq!(third.await.unwrap(), Ok("r3".to_string()));
        assert!(!first.is_finished());

        probe.gate("one").open();
        assert_eq!(first.await.unwrap(), Ok("r1".to_string()));
        let stats = wait_for_stats(&pool, |stats| stats.available == 2).await;
        assert_eq!((stats.queued, stats.in_flight), (0, 0));
        assert!(probe.max_active() <= 2);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_units() {
        let world = FakeWorld::new(&[]);
        let pool = pool(&world, 3, None);
        let calls: Vec<_> = (0..12)
            .map(|index| pool.execute(Request::inline(format!("sleep '10'\necho 'r{index}'"))))
            .collect();
        let outputs = join_all(calls).await;
        for (index, output) in outputs.into_iter().enumerate() {
            assert_eq!(output, Ok(format!("r{index}")));
        }
        assert!(world.probe().max_active() <= 3);
    }

    #[tokio::test]
    async fn test_single_unit_admits_in_submission_order() {
        let world = FakeWorld::new(&[]);
        let pool = pool(&world, 1, None);
        let calls: Vec<_> = (0..5)
            .map(|index| pool.execute(Request::inline(format!("echo 'r{index}'"))))
            .collect();
        join_all(calls).await;

        let runs = world.probe().runs();
        let expected: Vec<_> = (0..5).map(|index| format!("echo 'r{index}'")).collect();
        assert_eq!(runs, expected);
    }

    #[tokio::test]
    async fn test_failed_start_rejects_queued_and_retries() {
        let world = FakeWorld::new(&[]);
        world
            .fetcher
            .serve_status(FakeWorld::IMAGE_URL, 404, "Not Found");
        let pool = pool(&world, 2, None);

        let (first, second) = tokio::join!(
            pool.execute(Request::inline("echo 'a'")),
            pool.execute(Request::inline("echo 'b'"))
        );
        let expected = PoolError::Transport(
            "could not download runtime image php.wasm: 404 Not Found".to_string(),
        );
        assert_eq!(first, Err(expected.clone()));
        assert_eq!(second, Err(expected));
        assert_eq!(pool.stats().await.unwrap().queued, 0);

        world
            .fetcher
            .serve(FakeWorld::IMAGE_URL, b"\0asm fake runtime".to_vec());
        assert_eq!(
            pool.execute(Request::inline("echo 'c'")).await,
            Ok("c".to_string())
        );
    }

    #[tokio::test]
    async fn test_warm_up_failure_does_not_block_units() {
        let world = FakeWorld::new(&[]);
        let pool = pool(&world, 2, Some("fail 'warm-up broke'"));
        assert_eq!(
            pool.execute(Request::inline("echo 'served'")).await,
            Ok("served".to_string())
        );
        let stats = wait_for_stats(&pool, |stats| stats.available == 2).await;
        assert!(stats.ready);
    }

    #[tokio::test]
    async fn test_warm_up_runs_once_per_unit() {
        let world = FakeWorld::new(&[]);
        let pool = pool(&world, 2, Some("echo 'warm'"));
        pool.initialize().await.unwrap();
        let warm_ups = world
            .probe()
            .runs()
            .iter()
            .filter(|source| source.as_str() == "echo 'warm'")
            .count();
        assert_eq!(warm_ups, 2);
    }

    #[tokio::test]
    async fn test_interpreter_failure_reaches_caller() {
        let world = FakeWorld::new(&[]);
        let pool = pool(&world, 1, None);
        let err = pool
            .execute(Request::inline("echo 'hello'\nfail 'boom'"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Error running PHP code:\nhello");
        assert_eq!(
            pool.execute(Request::inline("echo 'next'")).await,
            Ok("next".to_string())
        );
    }

    #[tokio::test]
    async fn test_install_runs_on_bootstrap_unit() {
        let world = FakeWorld::new(&[("index.php", "echo 'home'")]);
        let pool = pool(&world, 2, None);
        assert_eq!(pool.install().await, Ok(true));
        assert!(world.is_persisted("/www/INSTALLED"));

        assert_eq!(
            pool.execute(Request::run("index.php")).await,
            Ok("home".to_string())
        );
        // The bootstrap unit and the pool units share a single image fetch.
        assert_eq!(world.fetcher.calls(FakeWorld::IMAGE_URL), 1);
        assert_eq!(world.fetcher.calls(FakeWorld::ARCHIVE_URL), 1);
    }
}
