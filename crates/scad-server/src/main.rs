use anyhow::Context;
use clap::Parser;
use scad_ai::{OpenAiChatModel, ScriptGenerator};
use scad_compiler::{ScadCompiler, sweep_work_dir};
use scad_server::config::ServerConfig;
use scad_server::{AppState, app};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env wins over the inherited environment, so load it before clap reads env.
    let dotenv = dotenvy::dotenv_override();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    let config = ServerConfig::parse();

    let compiler = ScadCompiler::new(config.compiler_config());
    let version = compiler.version().await.with_context(|| {
        format!(
            "OpenSCAD is required but '{}' could not be run",
            config.compiler.display()
        )
    })?;
    tracing::info!(
        %version,
        work_dir = %compiler.config().work_dir.display(),
        format = %compiler.format(),
        "found OpenSCAD"
    );
    match sweep_work_dir(&compiler.config().work_dir).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "removed meshes left by an earlier run"),
        Err(err) => tracing::warn!("could not sweep the work directory: {err}"),
    }

    let model = OpenAiChatModel::new(config.openai_config())
        .context("failed to build the text-generation client")?;
    let default_key = config.default_key();
    if default_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; every request must carry its own key");
    }

    let state = AppState::new(
        ScriptGenerator::new(model),
        compiler,
        default_key,
        config.session_limits(),
    );
    let reaper = state.spawn_reaper(config.reap_interval());

    let address = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(address = %listener.local_addr()?, model = %config.model, "listening");

    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {err}");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
            state.shutdown();
        })
        .await?;
    reaper.abort();
    Ok(())
}
