//! esthread-bench
//!
//! Spawns one agent, fires a batch of calls at it and reports throughput.
//! Settings are read from the file named by `ESTHREAD_CONFIG`.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use esthread::{
    config::Config, expose_api, transport, Api, ArrayBuffer, EsThread, ThreadConfig, Transfer,
    Value, WorkerKind,
};

#[derive(Parser, Debug)]
#[command(name = "esthread-bench")]
#[command(about = "Measure call throughput to an esthread agent")]
struct Args {
    /// Number of calls to issue
    #[arg(long, default_value_t = 10_000)]
    calls: usize,

    /// Size of the buffer transferred with each `scale` call (0 calls `echo`)
    #[arg(long, default_value_t = 0)]
    payload_bytes: usize,

    /// Use a shared worker instead of a dedicated one
    #[arg(long)]
    shared: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn bench_agent() {
    let api = Api::builder()
        .sync_method("echo", |args: Vec<Value>| {
            Ok(args.into_iter().next().unwrap_or_default())
        })
        .sync_method("scale", |args: Vec<Value>| -> Result<Transfer> {
            let buffer = args
                .first()
                .and_then(Value::as_buffer)
                .cloned()
                .context("scale expects a buffer")?;
            buffer.with_bytes_mut(|bytes| {
                for byte in bytes {
                    *byte = byte.wrapping_mul(2);
                }
            })?;
            Ok(Transfer::new(buffer)?)
        })
        .build();

    match api {
        Ok(api) => {
            if let Err(e) = expose_api(api) {
                tracing::error!(error = %e, "Failed to expose bench API");
            }
        }
        Err(e) => tracing::error!(error = %e, "Invalid bench API"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let mut options = config.worker.clone();
    if args.shared {
        options.kind = WorkerKind::Shared;
    }
    info!(kind = ?options.kind, calls = args.calls, payload_bytes = args.payload_bytes, "Starting bench");

    let transport = transport::spawn(bench_agent, &options).context("Failed to spawn agent")?;
    let thread_config = ThreadConfig::from_file_config(&config.thread);
    let thread = EsThread::spawn_with(transport, &thread_config)
        .await
        .context("Agent did not become ready")?;

    let started = Instant::now();
    let handles: Vec<_> = if args.payload_bytes == 0 {
        let echo = thread.method("echo")?;
        (0..args.calls)
            .map(|i| echo.call([Value::Int(i64::try_from(i).unwrap_or(i64::MAX))]))
            .collect()
    } else {
        let scale = thread.method("scale")?;
        (0..args.calls)
            .map(|_| {
                let buffer = ArrayBuffer::zeroed(args.payload_bytes);
                Transfer::new(buffer).map(|transfer| scale.call([transfer]))
            })
            .collect::<Result<_, _>>()?
    };
    info!(queued = thread.num_queued_jobs(), "Calls posted");

    thread.settled().await;
    let mut failed = 0usize;
    for handle in handles {
        if handle.await.is_err() {
            failed += 1;
        }
    }
    let elapsed = started.elapsed();

    #[allow(clippy::cast_precision_loss)]
    let per_second = args.calls as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        calls = args.calls,
        failed,
        elapsed = ?elapsed,
        per_second = %format!("{per_second:.0}"),
        "Bench finished"
    );

    thread.terminate().await?;
    Ok(())
}
