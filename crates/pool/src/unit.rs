//! Execution units: one interpreter per dedicated OS thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use platform::{Interpreter, MountOptions, OutputEvent};
use tokio::sync::mpsc;

use crate::config::InstallLayout;
use crate::error::PoolError;
use crate::image::RuntimeImage;
use crate::install::Installer;
use crate::mount::SerializedFs;
use crate::protocol::{ReplyBody, Request, UnitId, UnitMessage, UnitReply};
use crate::services::Services;

/// State of a single execution unit. All calls are sequential; the thread
/// wrapper feeds it one message at a time.
pub struct ExecutionUnit {
    id: UnitId,
    services: Services,
    layout: InstallLayout,
    image: Option<RuntimeImage>,
    image_received: bool,
    runtime: Option<Box<dyn Interpreter>>,
    mount: Option<Arc<SerializedFs>>,
    installer: Option<Installer>,
    debug: bool,
}

impl ExecutionUnit {
    pub fn new(id: UnitId, services: Services, layout: InstallLayout) -> Self {
        Self {
            id,
            services,
            layout,
            image: None,
            image_received: false,
            runtime: None,
            mount: None,
            installer: None,
            debug: false,
        }
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub fn has_image(&self) -> bool {
        self.image_received
    }

    pub fn load_image(&mut self, image: RuntimeImage) {
        if self.image_received {
            tracing::debug!("unit {} ignoring a second runtime image", self.id);
            return;
        }
        tracing::debug!("unit {} received runtime image ({} bytes)", self.id, image.len());
        self.image = Some(image);
        self.image_received = true;
    }

    /// Apply one protocol message. `LoadImage` produces no reply.
    pub async fn handle(&mut self, message: UnitMessage) -> Option<UnitReply> {
        let (id, result) = match message {
            UnitMessage::LoadImage(image) => {
                self.load_image(image);
                return None;
            }
            UnitMessage::Configure { id, debug } => {
                (id, self.configure(debug).await.map(|()| ReplyBody::Configured))
            }
            UnitMessage::CheckInstalled { id } => {
                (id, self.check_installed().await.map(ReplyBody::Installed))
            }
            UnitMessage::Install { id } => (id, self.install().await.map(ReplyBody::Installed)),
            UnitMessage::Execute { id, request, debug } => {
                self.debug = debug;
                (id, self.execute(&request).await.map(ReplyBody::Output))
            }
        };
        if let Err(err) = &result {
            tracing::debug!("unit {} request {} failed: {}", self.id, id, err);
        }
        Some(UnitReply {
            id,
            unit: self.id.clone(),
            result,
        })
    }

    pub async fn configure(&mut self, debug: bool) -> Result<(), PoolError> {
        self.debug = debug;
        self.interpreter().await?;
        Ok(())
    }

    pub async fn check_installed(&mut self) -> Result<bool, PoolError> {
        self.installer().await?.is_installed().await
    }

    pub async fn install(&mut self) -> Result<bool, PoolError> {
        self.installer().await?.ensure_installed().await
    }

    pub async fn execute(&mut self, request: &Request) -> Result<String, PoolError> {
        match request {
            Request::Run { path } => self.run_path(path).await,
            Request::RunInline { code } => self.run_inline(code).await,
        }
    }

    /// Run the script at `path`. Relative paths resolve against the
    /// document root.
    pub async fn run_path(&mut self, path: &str) -> Result<String, PoolError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(PoolError::InvalidRequest(
                "no PHP script path given".to_string(),
            ));
        }
        let resolved = if path.starts_with('/') {
            path.to_string()
        } else {
            self.layout.join(path)
        };
        self.run(&bootstrap_script(&resolved)).await
    }

    pub async fn run_inline(&mut self, code: &str) -> Result<String, PoolError> {
        if code.trim().is_empty() {
            return Err(PoolError::InvalidRequest("no PHP code given".to_string()));
        }
        self.run(code).await
    }

    async fn run(&mut self, source: &str) -> Result<String, PoolError> {
        let debug = self.debug;
        let id = self.id.clone();
        let runtime = self.interpreter().await?;
        runtime
            .refresh()
            .await
            .map_err(|err| PoolError::Runtime(format!("failed to refresh interpreter: {err:#}")))?;

        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let outcome = runtime.run(source, output_tx).await;

        let mut fragments = Vec::new();
        while let Ok(event) = output_rx.try_recv() {
            match event {
                OutputEvent::Stdout(bytes) => {
                    fragments.push(String::from_utf8_lossy(&bytes).into_owned());
                }
                OutputEvent::Stderr(bytes) if debug => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    tracing::debug!("unit {} stderr: {}", id, text);
                    fragments.push(text);
                }
                OutputEvent::Stderr(_) => {}
            }
        }
        let output = fragments.join("\n");

        match outcome {
            Ok(()) => Ok(output),
            Err(err) => {
                let detail = if output.is_empty() {
                    format!("{err:#}")
                } else {
                    output
                };
                Err(PoolError::Interpreter {
                    message: format!("Error running PHP code:\n{detail}"),
                })
            }
        }
    }

    /// The interpreter, built from the received image on first use.
    async fn interpreter(&mut self) -> Result<&mut Box<dyn Interpreter>, PoolError> {
        if self.runtime.is_none() {
            let image = self.image.take().ok_or_else(|| {
                PoolError::NotReady("runtime image not yet received".to_string())
            })?;
            let mount_options = MountOptions {
                mount_path: self.layout.doc_root.clone(),
            };
            let runtime = self
                .services
                .runtime
                .instantiate(image.into_bytes(), &mount_options)
                .map_err(|err| PoolError::Runtime(format!("{err:#}")))?;
            let mount = Arc::new(SerializedFs::new(runtime.fs()));
            mount.sync(true).await?;
            tracing::debug!("unit {} interpreter ready", self.id);
            self.mount = Some(mount);
            self.runtime = Some(runtime);
        }
        self.runtime
            .as_mut()
            .ok_or_else(|| PoolError::NotReady("interpreter unavailable".to_string()))
    }

    async fn installer(&mut self) -> Result<&Installer, PoolError> {
        self.interpreter().await?;
        if self.installer.is_none() {
            let mount = self
                .mount
                .clone()
                .ok_or_else(|| PoolError::NotReady("mount unavailable".to_string()))?;
            self.installer = Some(Installer::new(
                self.layout.clone(),
                Arc::clone(&self.services.fetcher),
                Arc::clone(&self.services.archive),
                mount,
            ));
        }
        self.installer
            .as_ref()
            .ok_or_else(|| PoolError::NotReady("installer unavailable".to_string()))
    }
}

fn bootstrap_script(path: &str) -> String {
    format!(
        "<?php\nerror_reporting(E_ALL);\nini_set('display_errors', 1);\nrequire '{}';\n",
        escape_single_quoted(path)
    )
}

fn escape_single_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

// ========== Unit thread ==========

/// Handle to an execution unit running on its own thread.
pub struct UnitHandle {
    id: UnitId,
    tx: mpsc::UnboundedSender<UnitMessage>,
    thread: JoinHandle<()>,
}

impl UnitHandle {
    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub fn send(&self, message: UnitMessage) -> Result<(), PoolError> {
        self.tx
            .send(message)
            .map_err(|_| PoolError::UnitGone(self.id.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the unit's inbox and wait for its thread to finish.
    pub async fn terminate(self) {
        let Self { id, tx, thread } = self;
        drop(tx);
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => tracing::debug!("unit {} terminated", id),
            _ => tracing::warn!("unit {} did not shut down cleanly", id),
        }
    }
}

/// Start an execution unit on a dedicated thread. Replies to correlated
/// messages are sent on `replies`.
pub fn spawn_unit(
    id: UnitId,
    services: Services,
    layout: InstallLayout,
    replies: mpsc::UnboundedSender<UnitReply>,
) -> Result<UnitHandle, PoolError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let unit_id = id.clone();
    // The interpreter is not `Send`, so the unit is built on its own thread.
    let thread = thread::Builder::new()
        .name(format!("php-{id}"))
        .spawn(move || run_unit(ExecutionUnit::new(unit_id, services, layout), rx, replies))
        .map_err(|err| {
            tracing::error!("failed to start unit {}: {}", id, err);
            PoolError::Runtime(format!("failed to start unit {id}: {err}"))
        })?;
    Ok(UnitHandle { id, tx, thread })
}

/// Main loop of a unit thread. Messages that arrive before the runtime
/// image are held and replayed in order once it does.
fn run_unit(
    mut unit: ExecutionUnit,
    mut rx: mpsc::UnboundedReceiver<UnitMessage>,
    replies: mpsc::UnboundedSender<UnitReply>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!("unit {} could not create its runtime: {}", unit.id(), err);
            return;
        }
    };

    tracing::debug!("unit {} started", unit.id());
    rt.block_on(async {
        let mut backlog = VecDeque::new();
        while let Some(message) = rx.recv().await {
            if !unit.has_image() && !matches!(message, UnitMessage::LoadImage(_)) {
                backlog.push_back(message);
                continue;
            }
            let loads_image = matches!(message, UnitMessage::LoadImage(_));
            deliver(&mut unit, message, &replies).await;
            if loads_image {
                while let Some(held) = backlog.pop_front() {
                    deliver(&mut unit, held, &replies).await;
                }
            }
        }
    });
    tracing::debug!("unit {} shutting down", unit.id());
}

async fn deliver(
    unit: &mut ExecutionUnit,
    message: UnitMessage,
    replies: &mpsc::UnboundedSender<UnitReply>,
) {
    if let Some(reply) = unit.handle(message).await {
        let _ = replies.send(reply);
    }
}
