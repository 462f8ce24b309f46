use std::error::Error;

use serde::Deserialize;
use wsmux::socket::client::{Socket, SocketEvent};

#[derive(Debug, Deserialize)]
struct Event {
    id: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (socket, mut events) = Socket::builder("ws://localhost:4000/ws").build()?;
        socket.on("event", |event: Event| println!("event id={}", event.id))?;
        socket.connect()?;

        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Connected => println!("connected"),
                SocketEvent::Disconnected => println!("disconnected"),
                SocketEvent::Error(err) => eprintln!("socket error: {err}"),
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
