//! One poll cycle over every configured source, then drain the queue and
//! print the resulting feed head. Handy for checking a config locally.

use reelwire::store::FeedStore;
use reelwire::{ingest::worker::drain, init_tracing, AppConfig, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::load_default()?;
    let services = Services::build(config).await?;

    let stats = services.scheduler.run_cycle().await;
    let processed = drain(services.stores.queue.as_ref(), &services.pipeline).await;
    let feed = services.stores.feed.snapshot(20).await?;

    println!(
        "sources={} ok={} not_modified={} failed={} enqueued={} processed={}",
        stats.sources, stats.ok, stats.not_modified, stats.failed, stats.enqueued, processed
    );
    for story in feed {
        println!("[{}] {} ({})", story.kind, story.title, story.source.key);
    }
    Ok(())
}
