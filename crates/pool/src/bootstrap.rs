use tokio::sync::mpsc;

use crate::config::InstallLayout;
use crate::error::PoolError;
use crate::image::RuntimeImage;
use crate::protocol::{ReplyBody, RequestId, RequestIdGen, UnitId, UnitMessage, UnitReply};
use crate::services::Services;
use crate::unit::{UnitHandle, spawn_unit};

/// A unit that exists only to run the installation workflow and is
/// terminated once it reports back.
pub struct BootstrapUnit {
    handle: UnitHandle,
    replies: mpsc::UnboundedReceiver<UnitReply>,
    ids: RequestIdGen,
}

impl BootstrapUnit {
    pub fn start(
        image: RuntimeImage,
        services: Services,
        layout: InstallLayout,
    ) -> Result<Self, PoolError> {
        let (reply_tx, replies) = mpsc::unbounded_channel();
        let handle = spawn_unit(UnitId::new("bootstrap"), services, layout, reply_tx)?;
        handle.send(UnitMessage::LoadImage(image))?;
        Ok(Self {
            handle,
            replies,
            ids: RequestIdGen::new("boot"),
        })
    }

    /// Configure the unit, check for an existing installation, install if
    /// needed, then shut the unit down.
    pub async fn install(mut self, debug: bool) -> Result<bool, PoolError> {
        let outcome = self.run_workflow(debug).await;
        self.handle.terminate().await;
        outcome
    }

    async fn run_workflow(&mut self, debug: bool) -> Result<bool, PoolError> {
        self.call(|id| UnitMessage::Configure { id, debug }).await?;
        match self.call(|id| UnitMessage::CheckInstalled { id }).await? {
            ReplyBody::Installed(true) => {
                tracing::debug!("installation already present");
                Ok(true)
            }
            ReplyBody::Installed(false) => match self.call(|id| UnitMessage::Install { id }).await? {
                ReplyBody::Installed(installed) => Ok(installed),
                other => Err(unexpected(&other)),
            },
            other => Err(unexpected(&other)),
        }
    }

    async fn call<F>(&mut self, message: F) -> Result<ReplyBody, PoolError>
    where
        F: FnOnce(RequestId) -> UnitMessage,
    {
        let id = self.ids.next_id();
        self.handle.send(message(id.clone()))?;
        loop {
            let reply = self
                .replies
                .recv()
                .await
                .ok_or_else(|| PoolError::UnitGone(self.handle.id().to_string()))?;
            if reply.id == id {
                return reply.result;
            }
            tracing::debug!("bootstrap unit ignoring reply {}", reply.id);
        }
    }
}

fn unexpected(body: &ReplyBody) -> PoolError {
    PoolError::Protocol(format!("unexpected reply from bootstrap unit: {body:?}"))
}
