//! Reference request driver for pools of interchangeable cloud servers.

use crate::handler::{RequestContext, RequestDriver};

/// Satisfies a request from one pool: reuse READY nodes first, launch new
/// ones otherwise, and pause while the pool is at `max_servers`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDriver;

impl StandardDriver {
    /// Why this pool can never satisfy the request, if it can't.
    fn decline_reason(ctx: &RequestContext) -> Option<String> {
        let pool = &ctx.pool().pool;
        let labels = &ctx.request().label_set;

        if let Some(label) = labels.iter().find(|l| !pool.serves(l)) {
            return Some(format!("label {label} is not served by pool {}", pool.name));
        }
        if let Some(label) = labels.iter().find(|l| !ctx.pool().manager.label_ready(l)) {
            return Some(format!("label {label} is not ready at the provider"));
        }
        if labels.len() > pool.max_servers as usize {
            return Some(format!(
                "request for {} nodes exceeds max_servers {}",
                labels.len(),
                pool.max_servers
            ));
        }
        None
    }
}

impl RequestDriver for StandardDriver {
    fn run_handler(&mut self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        // A paused request was already validated and accepted.
        if !ctx.is_paused() {
            if let Some(reason) = Self::decline_reason(ctx) {
                ctx.decline(&reason)?;
                return Ok(());
            }
            ctx.accept()?;
        }

        let max_servers = ctx.pool().pool.max_servers as usize;
        for label in ctx.missing_labels() {
            let mut reused = false;
            for candidate in ctx.reusable_nodes(&label)? {
                if ctx.lock_ready_node(&candidate)? {
                    reused = true;
                    break;
                }
            }
            if reused {
                ctx.unpause();
                continue;
            }

            if ctx.count_pool_nodes()? >= max_servers {
                ctx.pause();
                return Ok(());
            }
            ctx.unpause();
            ctx.launch_node(&label)?;
        }
        Ok(())
    }
}
