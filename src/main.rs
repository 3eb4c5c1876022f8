use tokio_util::sync::CancellationToken;
use voxbridge::{http, Settings, ServerContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let settings = Settings::load()?;
    let monitor_port = settings.monitor_port;
    let ctx = ServerContext::new(settings);

    log::info!("voxbridge starting");
    log::info!(
        "  sessions: max={} expiry={}min",
        ctx.settings.max_concurrent_sessions,
        ctx.settings.session_expiry_minutes
    );
    log::info!(
        "  asr: {} window={}ms slide={}ms",
        ctx.settings.whisper_base_url,
        ctx.settings.asr_window_ms,
        ctx.settings.asr_slide_ms
    );
    log::info!("  llm: {} model={}", ctx.settings.llm_base_url, ctx.settings.llm_model);
    log::info!(
        "  tts: {} fallback={}",
        ctx.settings.parler_tts_base_url,
        ctx.settings.xtts_tts_base_url.as_deref().unwrap_or("(none)")
    );

    let shutdown = CancellationToken::new();

    // Background service probes.
    let health = ctx.health.clone();
    let health_cancel = shutdown.child_token();
    let health_task = tokio::spawn(async move { health.run(health_cancel).await });

    // Idle session reclamation.
    let sweeper = ctx.coordinator.clone();
    let sweep_cancel = shutdown.child_token();
    let sweep_task = tokio::spawn(sweeper.run_expiry_sweeper(sweep_cancel));

    // Observability surface.
    let router = http::create_router(ctx.clone());
    let addr = format!("0.0.0.0:{monitor_port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("  monitor: http://{addr} (/health, /metrics)");

    let server_cancel = shutdown.child_token();
    let server_task = tokio::spawn(async move {
        let shutdown_signal = async move { server_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            log::error!("monitor server error: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");

    shutdown.cancel();
    ctx.coordinator.shutdown_all().await;

    let _ = health_task.await;
    let _ = sweep_task.await;
    let _ = server_task.await;

    log::info!("voxbridge stopped");
    Ok(())
}
