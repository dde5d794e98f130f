use ai_inference_scheduler::models::{GenerationParams, SimulatedEngine};
use ai_inference_scheduler::resources::{detect_gpu_backend, AccountingProbe};
use ai_inference_scheduler::scheduler::request::CallerClass;
use ai_inference_scheduler::{RequestDistributor, SchedulerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

fn env_millis(key: &str, default: u64) -> anyhow::Result<Duration> {
    let ms = match std::env::var(key) {
        Ok(raw) => raw.trim().parse()?,
        Err(_) => default,
    };
    Ok(Duration::from_millis(ms))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 Starting inference scheduler");

    let config = SchedulerConfig::from_env()?;
    tracing::info!(
        "📊 Memory ceiling {}MB (margin {}MB), embedding batches of {} within {}ms",
        config.memory.ceiling_mb,
        config.memory.safety_margin_mb,
        config.batching.max_batch_size,
        config.batching.batch_window_ms
    );

    let backend = detect_gpu_backend();
    tracing::info!("🖥️  Accelerator backend: {}", backend.as_str());

    // The simulated engine reports its own allocations, so memory is accounted
    // against the configured ceiling whatever the backend.
    let probe = Arc::new(AccountingProbe::new(config.memory.ceiling_mb));
    let engine = SimulatedEngine::new(probe.clone())
        .with_load_delay(env_millis("SIM_LOAD_DELAY_MS", 500)?)
        .with_token_delay(env_millis("SIM_TOKEN_DELAY_MS", 30)?);

    let distributor = Arc::new(RequestDistributor::new(config, Arc::new(engine), probe)?);
    distributor.start().await?;
    tracing::info!("✅ Scheduler ready. Type a prompt; prefix with /summary, /embed or use /status");

    tokio::select! {
        result = prompt_loop(distributor.clone()) => {
            if let Err(e) = result {
                tracing::error!("❌ Prompt loop error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("🛑 Shutdown signal received");
        }
    }

    distributor.shutdown().await;
    tracing::info!("👋 Scheduler shutdown complete");
    Ok(())
}

async fn prompt_loop(distributor: Arc<RequestDistributor>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/status" {
            let status = distributor.get_status().await;
            stdout.write_all(serde_json::to_string_pretty(&status)?.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            continue;
        }

        if let Some(texts) = line.strip_prefix("/embed ") {
            let texts = texts.split('|').map(|t| t.trim().to_string()).collect();
            match distributor.submit_embedding(CallerClass::NpcEmbedding, texts, None, None).await {
                Ok(outcome) => {
                    stdout.write_all(format!("{}\n", serde_json::to_string(&outcome)?).as_bytes()).await?;
                }
                Err(e) => tracing::warn!("⚠️  Embedding rejected: {}", e),
            }
            continue;
        }

        let (caller, prompt) = match line.strip_prefix("/summary ") {
            Some(prompt) => (CallerClass::Summary, prompt),
            None => (CallerClass::Chat, line),
        };

        let mut stream = match distributor
            .submit_generation(caller, prompt, GenerationParams::default(), None, None)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("⚠️  Request rejected: {}", e);
                continue;
            }
        };

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    stdout.write_all(chunk.text.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Err(e) => {
                    tracing::error!("❌ Generation failed: {}", e);
                    break;
                }
            }
        }
        stdout.write_all(b"\n").await?;
        if let Some(summary) = stream.summary() {
            tracing::info!(
                "📈 {} tokens from {} (queued {}ms, generated in {}ms)",
                summary.tokens_generated,
                summary.model_type,
                summary.queue_wait_ms,
                summary.generation_ms
            );
        }
    }
    Ok(())
}

// Handles both interactive (Ctrl+C) and system (SIGTERM) shutdown signals
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
