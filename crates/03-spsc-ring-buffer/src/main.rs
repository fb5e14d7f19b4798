use std::io::Write as _;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use spsc_ring_buffer::{allocate, DEFAULT_BATCH, DEFAULT_CAPACITY};

#[derive(Parser)]
#[command(name = "spsc-ring-buffer", about = "Two-thread throughput driver for the ring buffer")]
struct Args {
    /// Timed trials (one extra warm-up trial runs first)
    #[arg(short, long, default_value_t = 3)]
    trials: usize,

    /// Events pushed through the buffer per trial
    #[arg(short, long, default_value_t = 5_120_000)]
    events: u64,
}

/// Stream `events` sequence numbers producer-to-consumer, verifying FIFO
/// order on the consumer side, and return the wall time for the hand-off.
fn trial(events: u64) -> Duration {
    let (mut producer, mut consumer) = allocate::<u64, DEFAULT_CAPACITY, DEFAULT_BATCH>();

    let start = Instant::now();
    let writer = thread::spawn(move || {
        for value in 1..=events {
            producer.produce(value);
        }
        producer.produced_last();
    });
    let reader = thread::spawn(move || {
        let mut expected = 0u64;
        while let Some(value) = consumer.consume() {
            expected += 1;
            assert_eq!(value, expected, "event out of order");
        }
        expected
    });
    writer.join().expect("producer thread panicked");
    let consumed = reader.join().expect("consumer thread panicked");
    let elapsed = start.elapsed();

    assert_eq!(consumed, events, "consumer missed events");
    elapsed
}

fn main() {
    let args = Args::parse();
    if args.trials == 0 || args.events == 0 {
        eprintln!("error: trials and events must both be positive");
        std::process::exit(1);
    }

    print!("Benchmarking {} events x {} trials", args.events, args.trials);
    std::io::stdout().flush().ok();

    trial(args.events); // warm-up, uncounted

    let mut timings = Vec::with_capacity(args.trials);
    for _ in 0..args.trials {
        print!(".");
        std::io::stdout().flush().ok();
        timings.push(trial(args.events));
    }
    println!();

    timings.sort();
    let median = timings[timings.len() / 2];
    let rate = args.events as f64 / median.as_secs_f64();

    println!();
    println!("{:<8} {:>12}", "trial", "millis");
    for (n, elapsed) in timings.iter().enumerate() {
        println!("{:<8} {:>12.2}", n, elapsed.as_secs_f64() * 1e3);
    }
    println!();
    println!("median:      {:.2} ms", median.as_secs_f64() * 1e3);
    println!("throughput:  {:.1} Mevents/s", rate / 1e6);
}
