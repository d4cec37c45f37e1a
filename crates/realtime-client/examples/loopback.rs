//! Publish and subscribe against the in-process loopback server.
//!
//! ```sh
//! RUST_LOG=debug cargo run -p realtime-client --example loopback -- [TOPIC] [json|msgpack]
//! ```
//!
//! Every published payload is echoed back to the topic listener, then the
//! loopback drops the link once to show resubscription and queue flushing.

use std::sync::Arc;
use std::time::Duration;

use realtime_client::{
    Codec, ConnectionChange, InboundEvent, LoopbackTransport, PublishOptions, RealtimeClient,
    RealtimeOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let topic = args.next().unwrap_or_else(|| "demo".to_string());
    let codec = match args.next().as_deref() {
        Some("msgpack") => Codec::MsgPack,
        _ => Codec::Json,
    };

    let transport = Arc::new(LoopbackTransport::with_codec(codec));
    let client = RealtimeClient::new(
        Arc::clone(&transport) as Arc<dyn realtime_client::Transport>,
        RealtimeOptions::new("loopback://local"),
    );

    client.on_connection_change(Arc::new(|change: &ConnectionChange| {
        match &change.error {
            Some(err) => eprintln!("status: {} ({err})", change.status),
            None => eprintln!("status: {}", change.status),
        }
    }));

    let _sub = client.subscribe(
        &topic,
        Arc::new(|event: &InboundEvent| {
            println!("{} <- {}", event.topic, event.payload);
        }),
    );

    client.connect().await?;

    for n in 1..=3 {
        let outcome = client
            .publish(&topic, serde_json::json!({ "n": n }), PublishOptions::default())
            .await?;
        eprintln!("published: {outcome:?}");
    }

    transport.drop_connection();
    tokio::time::sleep(Duration::from_millis(50)).await;
    eprintln!("server topics after reconnect: {:?}", transport.subscribed_topics());

    let outcome = client
        .publish(&topic, serde_json::json!("after reconnect"), PublishOptions::unacked())
        .await?;
    eprintln!("published: {outcome:?}");
    tokio::time::sleep(Duration::from_millis(50)).await;

    eprintln!("stats: {}", serde_json::to_string(&client.stats())?);
    client.destroy();
    Ok(())
}
