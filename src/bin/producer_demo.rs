//! Stands in for the application-side producer code that normally drives
//! this registry from outside the HTTP layer. A producer and the comet
//! endpoint share one in-process `Registry`, so this binary demonstrates
//! the registry/channel API end-to-end on its own: it creates a channel,
//! publishes a couple of tagged events against it, and prints the delivery
//! outcomes as they arrive.

use std::env;
use std::time::Duration;

use comet::registry::Registry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let registry = Registry::new(None);
    let channel = registry.create().await.expect("fresh registry, cap unset");

    println!("created channel {}", channel.id_of());

    let mut outcomes = channel.observe_outcomes();
    let reporter = tokio::spawn(async move {
        while let Ok((result, tag)) = outcomes.recv().await {
            println!("outcome for tag {tag}: {result:?}");
        }
    });

    let wait_secs: u64 = env::var("DEMO_WAIT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    tokio::time::sleep(Duration::from_secs(wait_secs)).await;

    channel.publish("hello world", Some(7));
    tokio::time::sleep(Duration::from_millis(200)).await;
    channel.publish("untagged event, no outcome will follow", None);

    tokio::time::sleep(Duration::from_secs(1)).await;
    reporter.abort();
}
