//! Example publishing to a local stand-in for Carbon.
//!
//! This example shows how to:
//! - Configure a publisher and its connection pool
//! - Publish records and loosely typed events
//! - Inspect what each wire protocol puts on the socket

use std::time::{Duration, SystemTime};

use graphyte::encode::events::Event;
use graphyte::{ClientConfig, GraphitePublisher, PoolConfig, Protocol, PublisherConfig, Record};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("graphyte loopback publish example");

    // A listener that prints whatever arrives, standing in for carbon-cache.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut socket, peer)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    print!("[carbon <- {peer}] {}", String::from_utf8_lossy(&buf[..n]));
                }
            });
        }
    });

    let config = PublisherConfig::new(ClientConfig::new("127.0.0.1", Protocol::Plaintext).with_port(port))
        .with_pool(PoolConfig::new(2).with_check_on_release(true));
    let mut publisher = GraphitePublisher::new(config);
    publisher.start().await?;

    let now = SystemTime::now();
    publisher
        .publish(&[
            Record::new("servers.web1.cpu.load", 0.72, now).with_tag("dc", "east"),
            Record::new("servers.web1.mem.used", 3_221_225_472.0, now).with_tag("dc", "east"),
        ])
        .await?;

    publisher
        .publish_events(&[
            Event::new("deploys.api", serde_json::json!("v1.4.2"), now),
            Event::new("deploys.api.duration", serde_json::json!(42.5), now),
        ])
        .await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    publisher.stop().await?;

    println!("\nSame record on each protocol:");
    let record = [Record::at_epoch_seconds("boo", 543.0, 0)];
    for protocol in [Protocol::Plaintext, Protocol::Pickle] {
        println!("  {protocol:<9} {:?}", protocol.encode(&record));
    }

    Ok(())
}
