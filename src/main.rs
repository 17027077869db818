use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use drivetime::config::Config;
use drivetime::reaper;
use drivetime::tenant::TenantManager;

#[derive(Serialize)]
struct TenantSummary {
    tenant: String,
    patterns: usize,
    created: usize,
    already_materialized: u32,
    skipped: usize,
    truncated: usize,
}

/// Expand every active pattern of every tenant, compact, and print one JSON
/// summary line per tenant. With `--watch`, keep maintaining the tenants
/// until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    drivetime::observability::init_tracing();

    let watch = std::env::args().skip(1).any(|arg| arg == "--watch");
    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir)?;

    let tenant_manager = Arc::new(if watch {
        TenantManager::from_config(&config)
    } else {
        TenantManager::new(config.data_dir.clone(), config.compact_threshold)
    });
    let tenants = match &config.tenants {
        Some(names) => names.clone(),
        None => tenant_manager.discover()?,
    };
    info!("drivetime materializing {} tenant(s)", tenants.len());
    info!("  data_dir: {}", config.data_dir.display());

    for tenant in &tenants {
        let engine = tenant_manager.get_or_create(tenant)?;
        let reports = engine.generate_all().await?;
        engine.compact_wal().await?;

        let summary = TenantSummary {
            tenant: tenant.clone(),
            patterns: reports.len(),
            created: reports.iter().map(|r| r.created.len()).sum(),
            already_materialized: reports.iter().map(|r| r.already_materialized).sum(),
            skipped: reports.iter().map(|r| r.skipped.len()).sum(),
            truncated: reports.iter().filter(|r| r.truncated()).count(),
        };
        println!("{}", serde_json::to_string(&summary)?);
    }

    if !watch {
        return Ok(());
    }

    info!(
        "watching, top-up every {}s, compaction past {} appends",
        config.topup_interval.as_secs(),
        config.compact_threshold
    );
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received, compacting");
    for tenant in tenant_manager.loaded() {
        let engine = tenant_manager.get_or_create(&tenant)?;
        if let Err(e) = reaper::compact_if_needed(&engine, 1).await {
            tracing::error!(%tenant, "final compaction failed: {e}");
        }
    }
    info!("drivetime stopped");
    Ok(())
}
