mod logging;

use std::{
    env,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use courier_core::{
    ConfigHandle, CourierConfig, CourierError, ErrorCategory, IdentityResolver, RetryPolicy,
    retry_with_backoff,
};
use courier_platform::{MemoryProbe, ProcMeminfoProbe, ProcessMemoryProbe};
use tokio_util::sync::CancellationToken;

const SAMPLE_IDS: &[&str] = &[
    "123456789012345:4@lid",
    "15551234567:2@s.whatsapp.net",
    "15557654321@c.us",
    "not-an-identifier",
];

/// Process RSS against the configured budget, or machine-wide usage when
/// `COURIER_MEMORY_SOURCE=system`.
fn memory_probe(budget_bytes: Option<u64>) -> Arc<dyn MemoryProbe> {
    let system_wide = env::var("COURIER_MEMORY_SOURCE")
        .is_ok_and(|source| source.trim().eq_ignore_ascii_case("system"));
    if system_wide {
        return Arc::new(ProcMeminfoProbe::default());
    }
    let probe = ProcessMemoryProbe::default();
    match budget_bytes {
        Some(budget) => Arc::new(probe.with_budget(budget)),
        None => Arc::new(probe),
    }
}

#[tokio::main]
async fn main() {
    logging::init();

    let config = match CourierConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    let probe = memory_probe(config.performance.memory_budget_bytes);
    let handle = ConfigHandle::new(config);
    let resolver = IdentityResolver::new(handle.clone());
    resolver.cache().start_maintenance(probe);

    let args: Vec<String> = env::args().skip(1).collect();
    let ids: Vec<&str> = if args.is_empty() {
        SAMPLE_IDS.to_vec()
    } else {
        args.iter().map(String::as_str).collect()
    };
    for id in ids {
        let info = resolver.resolve_sender(id);
        if info.is_valid {
            println!("{id} -> {} (user {})", info.canonical_id, info.user);
        } else {
            println!(
                "{id} -> invalid: {}",
                info.error.as_deref().unwrap_or("unknown")
            );
        }
    }

    let stop = CancellationToken::new();
    let policy = RetryPolicy::<CourierError>::new(
        3,
        Duration::from_millis(50),
        Duration::from_millis(400),
    )
    .with_attempt_timeout(Duration::from_secs(1))
    .with_cancellation(stop.clone())
    .retry_if(CourierError::is_transient)
    .on_retry(|err, attempt| tracing::warn!(attempt, %err, "flaky operation failed"));

    let failures_left = AtomicU32::new(2);
    let outcome = retry_with_backoff(&policy, |ctx| {
        let fail = failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        async move {
            if ctx.cancel.is_cancelled() {
                return Err(CourierError::new(
                    ErrorCategory::Cancelled,
                    "aborted",
                    "operation cancelled",
                ));
            }
            if fail {
                return Err(CourierError::from_http_status(503, "upstream unavailable"));
            }
            Ok(ctx.attempt)
        }
    })
    .await;

    match outcome {
        Ok(attempt) => println!("flaky operation succeeded on attempt {attempt}"),
        Err(err) => println!("flaky operation gave up: {err}"),
    }

    let stats = resolver.cache_stats();
    for (name, namespace) in [
        ("lidCache", stats.lid_cache),
        ("jidCache", stats.jid_cache),
        ("lidToJidCache", stats.lid_to_jid_cache),
    ] {
        if let Some(namespace) = namespace {
            println!(
                "{name}: {} keys (max {}, ttl {:?})",
                namespace.keys, namespace.max_size, namespace.ttl
            );
        }
    }

    stop.cancel();
    resolver.cache().shutdown();
}
