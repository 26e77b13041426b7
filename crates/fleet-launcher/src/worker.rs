//! The per-pool request loop of a launcher.
//!
//! Each iteration re-registers the launcher, gives a paused handler the
//! first chance at capacity, assigns new REQUESTED node requests to fresh
//! handlers, and polls active handlers until they complete.

use std::sync::Arc;
use std::time::Duration;

use fleet_state::RequestState;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::driver::StandardDriver;
use crate::error::LauncherResult;
use crate::handler::{NodeRequestHandler, PoolContext, RequestDriver};
use crate::lock::SessionLock;

/// Builds a driver for each new handler.
pub type DriverFactory = Arc<dyn Fn() -> Box<dyn RequestDriver> + Send + Sync>;

pub struct PoolWorker {
    ctx: PoolContext,
    driver_factory: DriverFactory,
    handlers: Vec<NodeRequestHandler>,
    /// At most one handler waits for capacity; while it does no new
    /// requests are taken.
    paused: Option<NodeRequestHandler>,
    watermark_sleep: Duration,
}

impl PoolWorker {
    pub fn new(ctx: PoolContext, driver_factory: DriverFactory, watermark_sleep: Duration) -> Self {
        Self {
            ctx,
            driver_factory,
            handlers: Vec::new(),
            paused: None,
            watermark_sleep,
        }
    }

    /// Worker using `StandardDriver`.
    pub fn standard(ctx: PoolContext, watermark_sleep: Duration) -> Self {
        Self::new(ctx, Arc::new(|| Box::new(StandardDriver)), watermark_sleep)
    }

    pub fn launcher_id(&self) -> &str {
        &self.ctx.launcher_id
    }

    /// Handlers still being polled.
    pub fn active_handlers(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    /// Launch tasks still running across all handlers.
    pub fn alive_task_count(&self) -> usize {
        self.handlers
            .iter()
            .chain(self.paused.iter())
            .map(NodeRequestHandler::alive_task_count)
            .sum()
    }

    /// One pass of the worker loop.
    pub fn run_once(&mut self) -> LauncherResult<()> {
        if !self.ctx.session.is_connected() {
            debug!(launcher = %self.ctx.launcher_id, "store session not connected; skipping");
            return Ok(());
        }
        self.ctx
            .store
            .register_launcher(&self.ctx.launcher_id, &self.ctx.session);

        self.run_paused_handler();
        if self.paused.is_none() {
            self.assign_handlers()?;
        }
        self.remove_completed_handlers();
        Ok(())
    }

    fn run_paused_handler(&mut self) {
        let Some(mut handler) = self.paused.take() else {
            return;
        };
        if let Err(e) = handler.run() {
            error!(request = %handler.request().id, error = %e, "paused handler failed");
            handler.abort();
            return;
        }
        if handler.is_paused() {
            self.paused = Some(handler);
        } else {
            self.handlers.push(handler);
        }
    }

    /// True while the provider's launches in flight, across all of its
    /// pools, have reached `max_concurrency`.
    fn at_capacity(&self) -> bool {
        self.ctx
            .provider
            .max_concurrency
            .is_some_and(|max| self.ctx.launches.active() >= max as usize)
    }

    fn assign_handlers(&mut self) -> LauncherResult<()> {
        let store = &self.ctx.store;
        for request in store.list_requests()? {
            if !self.ctx.session.is_connected() || self.at_capacity() {
                return Ok(());
            }
            if request.state != RequestState::Requested
                || request.is_declined_by(&self.ctx.launcher_id)
            {
                continue;
            }

            let mut lock = SessionLock::new(store.request_lock(
                &request.id,
                &self.ctx.session,
                Some(&self.ctx.launcher_id),
            ));
            if !lock.acquire(false, None, true)? {
                debug!(request = %request.id, "request locked by another launcher");
                continue;
            }
            // Re-check under the lock; it may have moved on meanwhile.
            let Some(request) = store.get_request(&request.id)? else {
                continue;
            };
            if request.state != RequestState::Requested
                || request.is_declined_by(&self.ctx.launcher_id)
            {
                continue;
            }

            info!(
                request = %request.id,
                launcher = %self.ctx.launcher_id,
                labels = ?request.label_set,
                "assigning node request"
            );
            let mut handler =
                NodeRequestHandler::new(self.ctx.clone(), request, lock, (self.driver_factory)());
            if let Err(e) = handler.run() {
                error!(request = %handler.request().id, error = %e, "request handler failed");
                handler.abort();
                continue;
            }
            if handler.is_paused() {
                self.paused = Some(handler);
                return Ok(());
            }
            self.handlers.push(handler);
        }
        Ok(())
    }

    fn remove_completed_handlers(&mut self) {
        let mut active = Vec::with_capacity(self.handlers.len());
        for mut handler in std::mem::take(&mut self.handlers) {
            match handler.poll() {
                Ok(true) => debug!(request = %handler.request().id, "handler finished"),
                Ok(false) => active.push(handler),
                Err(e) => {
                    error!(request = %handler.request().id, error = %e, "error polling handler");
                    handler.abort();
                }
            }
        }
        self.handlers = active;
    }

    /// Release a paused handler's nodes and unregister the launcher.
    pub fn shutdown(&mut self) {
        if let Some(mut handler) = self.paused.take() {
            warn!(request = %handler.request().id, "releasing paused request on shutdown");
            handler.abort();
        }
        self.ctx.store.unregister_launcher(&self.ctx.launcher_id);
    }

    /// Run the worker loop until `shutdown` fires.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            launcher = %self.ctx.launcher_id,
            pool = %self.ctx.pool.name,
            "pool worker started"
        );
        loop {
            if let Err(e) = self.run_once() {
                error!(launcher = %self.ctx.launcher_id, error = %e, "pool worker iteration failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.watermark_sleep) => {}
                _ = shutdown.changed() => {
                    info!(launcher = %self.ctx.launcher_id, "pool worker shutting down");
                    break;
                }
            }
        }
        self.shutdown();
    }
}
