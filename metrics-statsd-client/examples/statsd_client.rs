use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_statsd_client::{StatsdBuilder, TagFormat};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

fn main() {
    tracing_subscriber::fmt::init();

    let client = StatsdBuilder::default()
        .with_remote_address("localhost:9125")
        .expect("failed to parse remote address")
        .with_prefix("demo")
        .with_tag_format(TagFormat::Datadog)
        .with_tags([("system", "foo")])
        .with_flush_interval(Duration::from_millis(250))
        .install()
        .expect("failed to install StatsD recorder");

    counter!("idle_metric").increment(1);
    gauge!("testing").set(42.0);

    let server_loops = counter!("tcp_server_loops");
    let server_loops_delta_secs = histogram!("tcp_server_loop_delta_secs");
    let sampled = client.with_sample_rate(0.1);

    let mut rng = Xoshiro256StarStar::try_from_rng(&mut rand::rng()).unwrap();

    // Loop over and over, pretending to do some work.
    for i in 0..100_000u64 {
        let timing = client.new_timing();

        server_loops.increment(1);
        server_loops_delta_secs.record(rng.random_range(0.0..1.0));

        let increment_gauge = rand::random_bool(0.75);
        let gauge = gauge!("lucky_iterations");
        if increment_gauge {
            gauge.increment(1.0);
        } else {
            gauge.decrement(1.0);
        }

        sampled.unique("seen_iterations", &(i % 1_000).to_string());
        timing.send("loop_time");
    }

    client.close().expect("failed to flush remaining metrics");
}
