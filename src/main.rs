use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use growth_eng::engine::Engine;
use growth_eng::http::auth::StaticTokenVerifier;
use growth_eng::http::{AppState, build_router};
use growth_eng::policy::RewardPolicy;
use growth_eng::store::MemoryStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive")))
        .with_writer(std::io::stderr)
        .init();

    let addr = env::var("GROWTH_ENG_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    let policy = match env::var("GROWTH_ENG_POLICY") {
        Ok(path) => RewardPolicy::from_file(&path).expect("failed to load policy file"),
        Err(_) => RewardPolicy::default(),
    };

    let verifier = match env::var("GROWTH_ENG_TOKENS") {
        Ok(path) => StaticTokenVerifier::from_file(&path).expect("failed to load token file"),
        Err(_) => {
            warn!("GROWTH_ENG_TOKENS not set; all authenticated routes will reject");
            StaticTokenVerifier::new()
        }
    };

    let engine = Arc::new(Engine::new(MemoryStore::new(), policy).expect("invalid policy"));

    // Stand-in for the platform scheduler: run the bulk jobs on an interval
    // when one is configured.
    if let Some(secs) = env::var("GROWTH_ENG_JOB_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|&secs| secs > 0)
    {
        let jobs = engine.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(secs));
            tick.tick().await; // the first tick fires immediately
            loop {
                tick.tick().await;
                if let Err(e) = jobs.daily_bonus().await {
                    warn!(reason = %e, "daily bonus run failed");
                }
                if let Err(e) = jobs.update_levels().await {
                    warn!(reason = %e, "level update run failed");
                }
            }
        });
    }

    let state = AppState {
        engine,
        verifier: Arc::new(verifier),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    info!(%addr, "growth-eng listening");
    axum::serve(listener, app).await.expect("server error");
}
