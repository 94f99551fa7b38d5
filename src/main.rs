use std::{panic, sync::Arc};

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use coderunner_judge::{
    config::JudgeConfig,
    core::{
        events::TracingSink,
        pipeline::{
            judging::Judge,
            scheduler::{Scheduler, SchedulerConfig},
        },
        registry::RunnerRegistry,
    },
    native::{executor::NativeExecutor, provisioner::NativeProvisioner},
    response::{RunRequest, RunResponse},
};

/// Reads one run request as JSON from stdin, judges it and prints the
/// response as JSON to stdout. An optional argument names a config file.
#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let config_path = std::env::args().nth(1);
    let config = JudgeConfig::load(config_path.as_deref())?;
    tracing::info!(?config, "Configuration loaded");

    let judge = Judge::new(
        Arc::new(NativeProvisioner::new(config.sandbox.clone())),
        Arc::new(NativeExecutor::new(
            config.compile_time_ceiling(),
            config.compile_memory_bytes,
        )),
        Arc::new(RunnerRegistry::with_languages(&config.enabled_languages()?)),
        Arc::new(TracingSink),
        config.provisioning_overhead(),
    );
    let scheduler = Scheduler::new(judge, SchedulerConfig::from(&config));

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let request: RunRequest = serde_json::from_str(&input)?;
    let created_at = Utc::now();
    let submission = request.into_submission(&config.default_limits())?;
    let id = submission.id;

    let response = match scheduler.submit(submission) {
        Ok(mut handle) => {
            let judged = tokio::select! {
                judged = &mut handle => judged,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Interrupted, cancelling submission {}", id);
                    handle.cancel();
                    handle.await
                }
            };
            match judged {
                Ok(verdict) => RunResponse::from_verdict(&verdict, created_at),
                Err(reason) => RunResponse::rejected(id, &reason, created_at),
            }
        }
        Err(reason) => RunResponse::rejected(id, &reason, created_at),
    };

    println!("{}", serde_json::to_string_pretty(&response)?);

    scheduler.shutdown(config.drain_timeout()).await;
    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
