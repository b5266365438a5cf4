use std::time::Duration;

use linkflow_core::config::{ConfigBuilder, SharedConfig};
use linkflow_core::types::Id;
use linkflow_transport::framing::frame_text;
use linkflow_transport::{ClientRegistry, ConnectionState, TransportRegistry};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::info;

/// A pretend display that answers every line with `OK <line>`
async fn run_fake_display(listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        info!("display: controller connected from {}", peer);

        tokio::spawn(async move {
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if write_half.write_all(format!("OK {}\n", line).as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(run_fake_display(listener));

    // A site file as it would be deployed; LINKFLOW__LINK__PACING_MS etc. override it
    let config_path = std::env::temp_dir().join(format!("linkflow-line-client-{}.toml", std::process::id()));
    std::fs::write(
        &config_path,
        format!(
            r#"
[general]
app_name = "lobby"

[logging]
level = "debug"

[link]
retry_interval_ms = 1000
pacing_ms = 200

[[clients]]
name = "lobby-display"
endpoint = "tcp://host=127.0.0.1;port={}"
delimiter = "\n"
"#,
            port
        ),
    )?;

    let config = SharedConfig::new(
        ConfigBuilder::new()
            .with_config_file(&config_path)
            .with_environment_prefix("LINKFLOW")
            .build()?,
    );
    std::fs::remove_file(&config_path)?;
    linkflow_core::init_with_config(config.get())?;

    let registry = ClientRegistry::from_config(
        config.get(),
        &TransportRegistry::with_defaults(),
        |_, builder| builder.on_frame(|frame| info!("reply: {}", frame_text(&frame))),
    )?;

    // Watch state transitions of every client
    let mut changes = registry.subscribe_states();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            info!(
                "{}: {} -> {} (status {})",
                change.source,
                change.old_state,
                change.new_state,
                change.new_state.status_code()
            );
        }
    });

    let client = registry.get(&Id::from("lobby-display"))?;

    // Commands queued before the link is up are sent once it connects
    client.send_line("POWER ON")?;
    for (id, outcome) in registry.connect_all().await? {
        info!("{}: {:?}", id, outcome);
    }
    client.send_line("INPUT HDMI1")?;
    client.send_line("VOLUME 20")?;

    sleep(Duration::from_secs(1)).await;

    registry.disconnect_all().await?;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    info!("done");

    Ok(())
}
