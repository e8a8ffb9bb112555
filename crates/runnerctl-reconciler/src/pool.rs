//! Pool Controller (C9, §4.5): reconciles each active image's warm `ready`
//! inventory to its configured `pool_size`, plus a companion idle-reclaim
//! job that hands stale `ready` runners back to the Termination Pipeline.

use chrono::{Duration as ChronoDuration, Utc};
use runnerctl_domain::{ImageStatus, RunnerState};
use serde_json::json;
use tracing::{info, warn};

use crate::allocator::launch_pool_runner;
use crate::engine::Engine;
use crate::error::PipelineError;
use crate::history;
use crate::report::{PoolChange, PoolReconcileReport};
use crate::termination;

/// One pass over every active image (§4.5 steps 1-2). Launches and
/// scale-down terminations are dispatched as background tasks; the report
/// reflects what was *requested* this cycle, not what has completed.
pub async fn reconcile_pools(engine: &Engine) -> Result<PoolReconcileReport, PipelineError> {
    let mut report = PoolReconcileReport::new();

    for image in engine.store.list_images().await? {
        if image.status != ImageStatus::Active || image.pool_size == 0 {
            continue;
        }
        let ready_count = engine.store.count_ready_for_image(&image.id).await?;

        if ready_count < image.pool_size {
            let deficit = image.pool_size - ready_count;
            for _ in 0..deficit {
                report.changes.push(PoolChange::LaunchRequested { image_id: image.id.clone() });
                let engine = engine.clone();
                let image = image.clone();
                tokio::spawn(async move {
                    if let Err(e) = launch_pool_runner(&engine, &image).await {
                        warn!(image_id = %image.id, error = %e, "pool scale-up launch failed");
                    }
                });
            }
        } else if ready_count > image.pool_size {
            let surplus = (ready_count - image.pool_size) as usize;
            let mut ready_runners = engine.store.list_ready_for_image(&image.id).await?;
            ready_runners.sort_by_key(|r| r.created_at);
            for runner in ready_runners.into_iter().take(surplus) {
                report.changes.push(PoolChange::ScaleDownEnqueued {
                    image_id: image.id.clone(),
                    runner_id: runner.id.clone(),
                });
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        termination::run(&engine, runner.id.clone(), "pool_scale_down".into(), RunnerState::ClosedPool)
                            .await
                    {
                        warn!(runner_id = %runner.id, error = %e, "pool scale-down termination failed");
                    }
                });
            }
        }
    }

    if report.is_fixed_point() {
        info!("pool reconcile: already at fixed point, no changes");
    }
    Ok(report)
}

/// Reclaims `ready` runners whose `updated_on` is older than
/// `idle_pool_minutes` (§4.5 "companion job").
pub async fn reclaim_idle(engine: &Engine) -> Result<PoolReconcileReport, PipelineError> {
    let mut report = PoolReconcileReport::new();
    let threshold = Utc::now() - ChronoDuration::minutes(engine.config.idle_pool_minutes);
    let idle = engine.store.list_idle_ready(threshold).await?;

    for runner in idle {
        history::record(&engine.store, &runner.id, "idle_pool_reclaim_enqueued", json!({}), "idle_pool_job").await?;
        report.changes.push(PoolChange::IdleReclaimed { runner_id: runner.id.clone() });
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) =
                termination::run(&engine, runner.id.clone(), "idle_pool_job".into(), RunnerState::ClosedPool).await
            {
                warn!(runner_id = %runner.id, error = %e, "idle reclaim termination failed");
            }
        });
    }

    Ok(report)
}
