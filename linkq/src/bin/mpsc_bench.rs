//! Intrusive MPSC queue throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin mpsc_bench
//!
//! Environment variables:
//!     PRODUCERS=4               Number of producer threads (default: 4)
//!     ITEMS_PER_PRODUCER=N      Nodes enqueued by each producer (default: 1048576)
//!     CONSUMER_CPU=0            Pin consumer to CPU 0 (default: 0)
//!     PRODUCER_CPU_BASE=1       Pin producer i to CPU base + i (default: 1)

use std::env;
use std::hint;
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use linkq::{Link, Node, Queue};

#[derive(Node, Default)]
struct BenchNode {
    link: Link<Self>,
    producer: u32,
    seq: u64,
}

struct Config {
    producers: usize,
    items_per_producer: usize,
    consumer_cpu: Option<usize>,
    producer_cpu_base: Option<usize>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn load_config() -> Config {
    Config {
        producers: env_or("PRODUCERS", 4usize).max(1),
        items_per_producer: env_or("ITEMS_PER_PRODUCER", 1usize << 20),
        consumer_cpu: Some(env_or("CONSUMER_CPU", 0usize)),
        producer_cpu_base: Some(env_or("PRODUCER_CPU_BASE", 1usize)),
    }
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn bench_throughput(config: &Config) {
    let nodes: Vec<Vec<BenchNode>> = (0..config.producers)
        .map(|p| {
            (0..config.items_per_producer)
                .map(|seq| BenchNode {
                    producer: p as u32,
                    seq: seq as u64,
                    ..BenchNode::default()
                })
                .collect()
        })
        .collect();
    let stub = BenchNode::default();
    let queue = Queue::new(&stub);
    let total = config.producers * config.items_per_producer;
    let start_line = Barrier::new(config.producers + 1);

    let (elapsed, out_of_order) = thread::scope(|s| {
        for (p, batch) in nodes.iter().enumerate() {
            let queue = &queue;
            let start_line = &start_line;
            let cpu = config.producer_cpu_base.map(|base| base + p);
            s.spawn(move || {
                pin_to_cpu(cpu);
                start_line.wait();
                for node in batch {
                    // SAFETY: batches are disjoint and no node is reused.
                    unsafe { queue.enqueue(node) };
                }
            });
        }

        let consumer = s.spawn(|| {
            pin_to_cpu(config.consumer_cpu);
            start_line.wait();
            let consumer = match queue.consumer() {
                Ok(consumer) => consumer,
                Err(err) => {
                    eprintln!("failed to claim consumer: {err}");
                    return (Duration::ZERO, usize::MAX);
                }
            };
            let mut next_seq = vec![0u64; config.producers];
            let mut out_of_order = 0usize;

            let start = Instant::now();
            let mut received = 0usize;
            while received < total {
                match consumer.try_dequeue_spin(1 << 10) {
                    Some(node) => {
                        let expected = &mut next_seq[node.producer as usize];
                        if node.seq != *expected {
                            out_of_order += 1;
                        }
                        *expected = node.seq + 1;
                        received += 1;
                    }
                    None => hint::spin_loop(),
                }
            }
            (start.elapsed(), out_of_order)
        });

        consumer.join().unwrap_or((Duration::ZERO, usize::MAX))
    });

    let secs = elapsed.as_secs_f64();
    let mops = if secs > 0.0 {
        total as f64 / secs / 1e6
    } else {
        0.0
    };

    println!("=== Throughput ===");
    println!("producers:      {}", config.producers);
    println!("items:          {total}");
    println!("elapsed:        {:.3} ms", secs * 1e3);
    println!("throughput:     {mops:.2} M ops/sec");
    println!("out of order:   {out_of_order}");
}

fn bench_latency(config: &Config) {
    const ROUNDS: usize = 100_000;

    let stub = BenchNode::default();
    let nodes: Vec<BenchNode> = (0..ROUNDS)
        .map(|seq| BenchNode {
            seq: seq as u64,
            ..BenchNode::default()
        })
        .collect();
    let queue = Queue::new(&stub);

    let mut samples = thread::scope(|s| {
        s.spawn(|| {
            pin_to_cpu(config.producer_cpu_base);
            for node in &nodes {
                // SAFETY: each node is enqueued exactly once.
                unsafe { queue.enqueue(node) };
            }
        });

        pin_to_cpu(config.consumer_cpu);
        let Ok(consumer) = queue.consumer() else {
            return Vec::new();
        };
        let mut samples = Vec::with_capacity(ROUNDS);
        let mut received = 0;
        while received < ROUNDS {
            let t0 = Instant::now();
            if consumer.try_dequeue_spin_until_linked().is_some() {
                samples.push(t0.elapsed().as_nanos() as u64);
                received += 1;
            } else {
                hint::spin_loop();
            }
        }
        samples
    });

    if samples.is_empty() {
        println!("=== Dequeue latency: no samples ===");
        return;
    }
    samples.sort_unstable();
    let pct = |p: f64| samples[((samples.len() - 1) as f64 * p) as usize];

    println!("=== Dequeue latency (ns) ===");
    println!("p50:  {}", pct(0.50));
    println!("p99:  {}", pct(0.99));
    println!("p999: {}", pct(0.999));
    println!("max:  {}", samples[samples.len() - 1]);
}

fn main() {
    linkq::init_tracing();

    let config = load_config();
    println!(
        "Config: producers={} items_per_producer={} consumer_cpu={:?} producer_cpu_base={:?}",
        config.producers,
        config.items_per_producer,
        config.consumer_cpu,
        config.producer_cpu_base
    );

    bench_throughput(&config);
    bench_latency(&config);
}
