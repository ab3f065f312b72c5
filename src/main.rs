use anyhow::{Context, Result};
use kafkabus::{Bus, BusConfig, BusError, BusEvent};
use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let config = BusConfig::from_env()?;
    let topics = config.topics.clone();
    let bus = Bus::new(config).await.context("Failed to start bus")?;

    let report = bus.recover().await.context("Failed to recover from store")?;
    if report.topics > 0 {
        info!(
            "Recovered {} topics, {} records, {} groups",
            report.topics, report.records, report.groups
        );
    }

    for topic in topics {
        match bus
            .create_topic(&topic.name, topic.partitions, topic.config)
            .await
        {
            Ok(_) => {}
            Err(BusError::AlreadyExists(name)) => warn!("Topic {} already exists", name),
            Err(e) => return Err(e).with_context(|| format!("Failed to create topic {}", topic.name)),
        }
    }
    info!("Serving topics {:?}", bus.list_topics());

    let mut events = bus.events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(BusEvent::RecordAppended { .. }) => {}
                Ok(event) => debug!("{:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    bus.shutdown().await?;
    Ok(())
}
