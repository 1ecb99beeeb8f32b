use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::mpsc;

use glimpse_companion_lib::config::{AppConfig, app_config_dir};
use glimpse_companion_lib::core::bluetooth::{BluestRadio, ConnectionManager, ConnectionState, FileIdentityStore};
use glimpse_companion_lib::core::pipeline::{OpenAiClient, PipelineOrchestrator, TimedBackground};
use glimpse_companion_lib::{commands, logging, state::AppState};

const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config = AppConfig::load().await?;
    let api_key = std::env::var(API_KEY_ENV).with_context(|| format!("{} is not set", API_KEY_ENV))?;
    let (identity, identity_writer) = FileIdentityStore::in_dir(&app_config_dir()?).await?;
    info!("Saved peripheral file: {:?}", identity.path());

    let (events, queue) = mpsc::unbounded_channel();
    let radio = BluestRadio::start(&config.radio, events.clone()).await?;
    let connection = ConnectionManager::new(radio, Box::new(identity), config.radio.clone(), events.clone());

    let services = Arc::new(OpenAiClient::new(api_key, config.services.clone())?);
    let pipeline = PipelineOrchestrator::new(
        services.clone(),
        services,
        Arc::new(TimedBackground::new(Duration::from_secs(config.pipeline.lease_budget_secs))),
        config.pipeline.concurrency,
        events.clone(),
    );

    let app_state = AppState::spawn(connection, pipeline, events, queue);
    let mut state = app_state.watch_state();
    let mut indication = app_state.watch_indication();

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    error!("Engine stopped unexpectedly");
                    break;
                }
                let current = *state.borrow_and_update();
                info!("Connection state: {}", current);
                // nothing saved to reconnect to: look for the glasses
                if current == ConnectionState::Idle {
                    if let Err(e) = commands::connect(&app_state) {
                        error!("Failed to start scan: {}", e);
                    }
                }
            }
            changed = indication.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Last activity: {:?}", *indication.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    let stopped = app_state.shutdown().await;
    identity_writer.finish().await;
    stopped
}
