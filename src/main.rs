use color_eyre::{eyre::eyre, Result};
use mqttstreams::config::AppConfig;
use mqttstreams::mqtt::{
    MqttService, PublishOptions, RumqttConnector, SubscribeOptions, TopicEvent,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Serialize, Deserialize)]
struct Foo {
    bar: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => AppConfig::default_path().map_err(|e| eyre!("Failed to locate config: {}", e))?,
    };
    let config = AppConfig::ensure_default(&config_path)
        .await
        .map_err(|e| eyre!("Failed to load config {}: {}", config_path.display(), e))?;
    info!("Using broker {}", config.mqtt.broker_url());

    let service = MqttService::new(config.mqtt.clone(), RumqttConnector)
        .map_err(|e| eyre!("Failed to start MQTT service: {}", e))?;
    if config.mqtt.manage_connection_manually {
        service
            .connect(config.mqtt.clone())
            .await
            .map_err(|e| eyre!("Failed to connect: {}", e))?;
    }

    // Verbindungsstatus mitschreiben
    let mut status = service.status();
    let status_task = tokio::spawn(async move {
        while let Some(status) = status.next().await {
            info!("Mqtt client connection status: {}", status);
        }
    });

    let topic = config.demo.topic.clone();
    let mut stream = service
        .subscribe_to(&topic, SubscribeOptions::with_qos(config.demo.qos))
        .await
        .map_err(|e| eyre!("Failed to subscribe to {}: {}", topic, e))?;

    let publisher = service.clone();
    let publish_topic = topic.clone();
    tokio::spawn(async move {
        let msg = Foo {
            bar: "foo".to_string(),
        };
        match publisher
            .publish_json(&publish_topic, &msg, PublishOptions::default())
            .await
        {
            Ok(()) => info!("message sent"),
            Err(e) => error!("could not send message: {}", e),
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            event = stream.next() => match event {
                Some(Ok(TopicEvent::Granted(grant))) => info!("Successfully subscribed to {}", grant),
                Some(Ok(TopicEvent::Message(msg))) => match msg.decode::<Foo>() {
                    Ok(foo) => info!("Received Foo {{ bar: {} }}", foo.bar),
                    Err(_) => info!("Received {}", msg.render()),
                },
                Some(Err(e)) => {
                    warn!("Stream for {} ended: {}", topic, e);
                    break;
                }
                None => {
                    info!("Stream for {} closed", topic);
                    break;
                }
            }
        }
    }

    if let Err(e) = service.unsubscribe_from(topic.as_str()).await {
        warn!("Unsubscribe failed: {}", e);
    }
    service
        .end_with_callback(false, || info!("Connection closed"))
        .await
        .map_err(|e| eyre!("Failed to end MQTT service: {}", e))?;
    let _ = status_task.await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env();
    Ok(())
}

/// Filter from `RUST_LOG` directives, `info` when unset or invalid.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn setup_logging_env() {
    let directives = std::env::var("RUST_LOG").ok();
    FmtSubscriber::builder()
        .with_env_filter(log_filter(directives.as_deref()))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_keeps_per_crate_directives() {
        assert_eq!(
            log_filter(Some("mqttstreams=debug")).to_string(),
            "mqttstreams=debug"
        );
    }

    #[test]
    fn log_filter_falls_back_to_info() {
        assert_eq!(log_filter(None).to_string(), "info");
        assert_eq!(log_filter(Some("mqttstreams=loud")).to_string(), "info");
    }
}
