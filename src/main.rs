use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use redlimit::config::{Algorithm, Execution, LimiterOptions, Settings};
use redlimit::ratelimit::{HitResult, RateLimiter, SystemClock};
use redlimit::store::{self, Store};

/// Burst a single key through the limiter and report how many hits got through.
#[derive(Debug, Parser)]
#[command(name = "redlimit", version, about)]
struct Args {
    /// YAML configuration file; `REDLIMIT_*` environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Redis url, overrides the configuration
    #[arg(long)]
    redis_url: Option<String>,

    /// Key prefix, overrides the configuration
    #[arg(long)]
    prefix: Option<String>,

    /// fixed or sliding
    #[arg(long)]
    algorithm: Option<Algorithm>,

    /// scripted or transactional
    #[arg(long)]
    execution: Option<Execution>,

    /// Key to hit
    #[arg(long, default_value = "api:ip:127.0.0.1")]
    key: String,

    /// Total number of hits
    #[arg(long, default_value_t = 30_000)]
    calls: u64,

    /// Hits allowed per window
    #[arg(long, default_value_t = 1_000)]
    limit: u64,

    /// Window length in seconds
    #[arg(long, default_value_t = 1)]
    window: u64,

    /// Number of concurrent tasks issuing hits
    #[arg(long, default_value_t = 1)]
    concurrency: u64,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(url) = args.redis_url.clone() {
        settings.store.url = url;
    }
    if let Some(prefix) = args.prefix.clone() {
        settings.limiter.key_prefix = prefix;
    }
    if let Some(algorithm) = args.algorithm {
        settings.limiter.algorithm = algorithm;
    }
    if let Some(execution) = args.execution {
        settings.limiter.execution = execution;
    }
    info!(
        backend = ?settings.store.backend,
        algorithm = ?settings.limiter.algorithm,
        execution = ?settings.limiter.execution,
        prefix = %settings.limiter.key_prefix,
        "Configuration loaded"
    );

    let store = store::connect(&settings.store, Arc::new(SystemClock)).await?;
    let limiter = Arc::new(RateLimiter::new(store.clone(), settings.limiter.clone()));

    burst(&limiter, &args).await?;
    login_demo(store, &settings.limiter).await?;
    Ok(())
}

/// Fire `calls` hits at one key and report successful and throttled counts.
async fn burst(limiter: &Arc<RateLimiter>, args: &Args) -> anyhow::Result<()> {
    limiter.reset(&args.key).await?;

    let success = Arc::new(AtomicU64::new(0));
    let throttled = Arc::new(AtomicU64::new(0));
    let concurrency = args.concurrency.max(1);
    let started = Instant::now();

    let workers = (0..concurrency).map(|worker| {
        let limiter = limiter.clone();
        let success = success.clone();
        let throttled = throttled.clone();
        let key = args.key.clone();
        let (limit, window) = (args.limit, args.window);
        let calls = args.calls / concurrency + u64::from(worker < args.calls % concurrency);

        tokio::spawn(async move {
            let mut last = None;
            for _ in 0..calls {
                match limiter.hit(&key, limit, window).await {
                    Ok(result) => {
                        if result.is_allowed() {
                            success.fetch_add(1, Ordering::Relaxed);
                        } else {
                            throttled.fetch_add(1, Ordering::Relaxed);
                        }
                        last = Some(result);
                    }
                    Err(e) => {
                        warn!(error = %e, "Hit failed, counting as throttled");
                        throttled.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            last
        })
    });

    let mut last = None;
    for outcome in futures::future::join_all(workers).await {
        if let Some(result) = outcome? {
            last = Some(result);
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        calls = args.calls,
        successful = success.load(Ordering::Relaxed),
        throttled = throttled.load(Ordering::Relaxed),
        seconds = elapsed,
        requests_per_second = (args.calls as f64 / elapsed) as u64,
        "Burst finished"
    );
    if let Some(result) = last {
        info!(result = %serde_json::to_string(&result)?, "Last result");
    }
    Ok(())
}

/// Three hits against a budget of two per 30 seconds on a sliding window,
/// whatever algorithm the burst used.
async fn login_demo(store: Arc<dyn Store>, options: &LimiterOptions) -> anyhow::Result<Vec<HitResult>> {
    let options = LimiterOptions {
        algorithm: Algorithm::Sliding,
        ..options.clone()
    };
    let limiter = RateLimiter::new(store, options);

    limiter.reset("login:failed").await?;
    let mut results = Vec::with_capacity(3);
    for attempt in 1..=3 {
        let result = limiter.hit("login:failed", 2, 30).await?;
        info!(
            attempt = attempt,
            retry_after = ?result.wait(),
            result = %serde_json::to_string(&result)?,
            "login:failed"
        );
        results.push(result);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redlimit::store::MemoryStore;

    #[tokio::test]
    async fn test_login_demo_uses_sliding_window() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
        let options = LimiterOptions {
            algorithm: Algorithm::Fixed,
            ..LimiterOptions::default()
        };

        let results = login_demo(store, &options).await.unwrap();
        let over: Vec<bool> = results.iter().map(|result| result.over_limit).collect();
        assert_eq!(over, vec![false, false, true]);

        // A fixed window would have counted the rejected hit as the third.
        assert_eq!(results[2].current, 2);
        assert!(results[2].wait_ms > 0 && results[2].wait_ms <= 30_000);
    }
}
