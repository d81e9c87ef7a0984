use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use trackflow_queue::{InMemoryKvStore, KvStore, LocalQueue, QueueRuntime};
use trackflow_worker::app::{AdminState, build_app};
use trackflow_worker::settings::{Backend, WorkerSettings};
use trackflow_worker::tracks::{LoggingEnricher, subscribe_track_processing};

/// Background consumers to stop once the admin server exits.
enum Running {
    Local(QueueRuntime),
    #[cfg(feature = "redis")]
    Streams(Arc<trackflow_queue::StreamsQueue>),
}

impl Running {
    fn stop(self) {
        match self {
            Running::Local(runtime) => runtime.shutdown(),
            #[cfg(feature = "redis")]
            Running::Streams(queue) => queue.shutdown(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    trackflow_observability::init();

    let settings = WorkerSettings::from_env();
    let (state, running) = start_queue(&settings)?;

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(settings.admin_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.admin_addr))?;

    info!("admin listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    tokio::task::spawn_blocking(move || running.stop()).await?;
    Ok(())
}

fn start_queue(settings: &WorkerSettings) -> anyhow::Result<(AdminState, Running)> {
    let enricher = Arc::new(LoggingEnricher);

    if settings.backend == Backend::Streams {
        #[cfg(feature = "redis")]
        {
            let queue = Arc::new(trackflow_queue::StreamsQueue::new(
                &settings.redis_url,
                settings.queue.clone(),
            )?);
            subscribe_track_processing(queue.as_ref(), enricher)?;
            info!(redis_url = %settings.redis_url, "streams backend started");
            return Ok((AdminState::remote(queue.clone()), Running::Streams(queue)));
        }
        #[cfg(not(feature = "redis"))]
        {
            warn!("TRACKFLOW_BACKEND=streams but redis feature not enabled, falling back to local");
        }
    }

    let queue = LocalQueue::new(build_store(settings)?, settings.queue.clone());
    subscribe_track_processing(&queue, enricher)?;
    let runtime = queue.start()?;
    Ok((AdminState::local(queue), Running::Local(runtime)))
}

fn build_store(settings: &WorkerSettings) -> anyhow::Result<Arc<dyn KvStore>> {
    if settings.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            let store = trackflow_queue::RedisKvStore::new(&settings.redis_url)
                .with_context(|| format!("failed to open redis store at {}", settings.redis_url))?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "redis"))]
        {
            warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }
    Ok(InMemoryKvStore::arc())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
