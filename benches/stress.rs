use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, NaiveDateTime};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("bench")
        .user("slotkeeper")
        .password("slotkeeper");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid date")
}

/// The `n`th one-hour slot from the base date, 08:00 to 20:00 each day.
fn hour_slot(n: u64) -> (NaiveDateTime, NaiveDateTime) {
    let day = base_date() + Days::new(n / 12);
    let start = day.and_hms_opt(8 + (n % 12) as u32, 0, 0).expect("valid time");
    (start, start + chrono::Duration::hours(1))
}

/// A bookable resource open 08:00-20:00 every day of the week.
async fn create_resource(client: &Client, capacity: u32) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, is_bookable) VALUES ('{rid}', 'bench', true)"
        ))
        .await
        .unwrap();
    for day in 0..7 {
        client
            .batch_execute(&format!(
                "INSERT INTO windows (resource_id, day_of_week, start_time, end_time, capacity) \
                 VALUES ('{rid}', {day}, '08:00', '20:00', {capacity})"
            ))
            .await
            .unwrap();
    }
    rid
}

fn reserve_sql(rid: Ulid, customer: &str, (start, end): (NaiveDateTime, NaiveDateTime)) -> String {
    format!(
        "INSERT INTO reservations (resource_id, customer_id, start_datetime, end_datetime) \
         VALUES ('{rid}', '{customer}', '{}', '{}')",
        start.format("%Y-%m-%dT%H:%M:%S"),
        end.format("%Y-%m-%dT%H:%M:%S"),
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let rid = create_resource(&client, 1).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&reserve_sql(rid, "seq", hour_slot(i as u64)))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve latency", &mut latencies);
}

/// Every task fights over the same hours of the same windows.
async fn phase2_contended(host: &str, port: u16) {
    let capacity = 5;
    let n_tasks = 20;
    let n_slots = 50;

    let setup = connect(host, port).await;
    let rid = create_resource(&setup, capacity).await;

    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for task in 0..n_tasks {
        let host = host.to_string();
        let accepted = accepted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for slot in 0..n_slots {
                match client
                    .simple_query(&reserve_sql(rid, &format!("task-{task}"), hour_slot(slot)))
                    .await
                {
                    Ok(_) => accepted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_slots as usize;
    let ok = accepted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots = {total} attempts in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!(
        "  accepted {ok}, rejected {}, expected accepted {}",
        rejected.load(Ordering::Relaxed),
        capacity as u64 * n_slots
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let rid = create_resource(&setup, 10).await;
    for i in 0..200 {
        setup
            .batch_execute(&reserve_sql(rid, "prefill", hour_slot(i)))
            .await
            .unwrap();
    }

    // Writer tasks: keep reserving on the same resource in the background
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .simple_query(&reserve_sql(rid, "writer", hour_slot(w * 10_000 + i)))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let date = base_date() + Days::new(((r * reads_per_reader + i) % 17) as u64);
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM availability WHERE resource_id = '{rid}' AND date = '{date}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let rid = create_resource(&client, 1).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&reserve_sql(rid, "storm", hour_slot(i)))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTKEEPER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTKEEPER_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTKEEPER_PORT");

    println!("=== slotkeeper stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential reserve throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended reserves on shared windows");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
