mod audio;
mod config;
mod controller;
mod correlation;
mod error;
mod negotiator;
mod peer;
mod protocol;
mod signaling;

use anyhow::Context;
use config::Config;
use controller::{CallController, CallEvent};
use peer::PeerFactory;
use signaling::SignalingClient;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，默认 info 级别，可通过 RUST_LOG 覆盖
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 加载配置
    let config = Config::new()
        .and_then(Config::with_env_overrides)
        .map_err(anyhow::Error::msg)?;
    log::info!(
        "{} {} starting, signaling at {}",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.ws_url
    );

    // 事件通道，信令回调、对端连接和播放线程都往这里汇报
    let (tx_event, mut rx_event) = mpsc::unbounded_channel::<CallEvent>();

    let mut signaling = SignalingClient::new(config.client_name, config.is_sender);
    let tx = tx_event.clone();
    signaling.set_on_connected(move |result| {
        let _ = tx.send(CallEvent::SignalingReady(result));
    });
    let tx = tx_event.clone();
    signaling.set_on_signaled(move |signal| {
        let _ = tx.send(CallEvent::Signaled(signal));
    });

    let mut receive_loop = signaling
        .connect(&config.ws_url)
        .await
        .context("failed to open signaling connection")?;

    let mut controller = CallController::new(PeerFactory::new(config), signaling, tx_event);

    // 主事件循环
    let outcome = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break Ok(());
            }

            finished = &mut receive_loop => {
                break match finished {
                    Ok(Ok(())) => {
                        log::info!("Signaling connection closed");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("signaling session failed")),
                    Err(e) => Err(anyhow::Error::new(e).context("signaling task panicked")),
                };
            }

            Some(event) = rx_event.recv() => {
                if let Err(e) = controller.handle_event(event).await {
                    break Err(e);
                }
            }
        }
    };

    controller.shutdown().await;
    if let Err(e) = &outcome {
        log::error!("{:#}", e);
    }
    outcome
}
