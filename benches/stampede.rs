use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use washline::cache::TtlCache;
use washline::clock::SystemClock;
use washline::store::StoreError;

const LOAD_LATENCY: Duration = Duration::from_millis(20);

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

/// `callers` tasks ask for one cold key at once.
async fn cold_stampede(callers: usize) {
    let cache = Arc::new(TtlCache::<u64>::new(
        Some(Duration::from_secs(300)),
        Arc::new(SystemClock),
    ));
    let loads = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(callers);
    for _ in 0..callers {
        let cache = cache.clone();
        let loads = loads.clone();
        handles.push(tokio::spawn(async move {
            let start = Instant::now();
            cache
                .get("bookings:all", None, move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(LOAD_LATENCY).await;
                    Ok::<_, StoreError>(42)
                })
                .await
                .expect("load failed");
            start.elapsed()
        }));
    }

    let mut latencies = Vec::with_capacity(callers);
    for h in handles {
        latencies.push(h.await.expect("task panicked"));
    }
    print_latency(&format!("{callers} callers, cold key"), &mut latencies);
    println!("    loader ran {} time(s)", loads.load(Ordering::SeqCst));
}

/// Hot reads spread over `keys` keys from `tasks` tasks.
async fn warm_reads(tasks: usize, per_task: usize, keys: usize) {
    let cache = Arc::new(TtlCache::<u64>::new(
        Some(Duration::from_secs(300)),
        Arc::new(SystemClock),
    ));
    for k in 0..keys {
        let key = format!("bookings:{k}");
        cache
            .get(&key, None, || async { Ok::<_, StoreError>(0) })
            .await
            .expect("warmup failed");
    }

    let started = Instant::now();
    let mut handles = Vec::with_capacity(tasks);
    for t in 0..tasks {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(per_task);
            for i in 0..per_task {
                let key = format!("bookings:{}", (t + i) % keys);
                let start = Instant::now();
                cache
                    .get(&key, None, || async { Ok::<_, StoreError>(0) })
                    .await
                    .expect("read failed");
                latencies.push(start.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::with_capacity(tasks * per_task);
    for h in handles {
        all.extend(h.await.expect("task panicked"));
    }
    let elapsed = started.elapsed();
    print_latency(&format!("{tasks} tasks x {per_task} reads, {keys} keys"), &mut all);
    println!(
        "    throughput: {:.0} reads/s",
        all.len() as f64 / elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    println!("=== washline cache stampede benchmark ===\n");

    println!("[phase 1] cold key stampede");
    for callers in [10, 100, 1000] {
        cold_stampede(callers).await;
    }

    println!("\n[phase 2] warm reads");
    warm_reads(16, 10_000, 3).await;
    warm_reads(64, 2_000, 50).await;

    println!("\n=== benchmark complete ===");
}
