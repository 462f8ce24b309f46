use std::error::Error;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wsmux::socket::client::Socket;

#[derive(Debug, Serialize, Deserialize)]
struct Event {
    id: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (socket, _events) = Socket::builder("ws://localhost:4000/ws").build()?;
        socket.connect()?;

        // Queued immediately; replayed on open if the connection is not up yet.
        let reply: Event = socket
            .push_with_timeout(
                "echo",
                &Event {
                    id: "12341234".to_string(),
                },
                Some(Duration::from_secs(5)),
            )
            .await?;
        println!("echo reply id={}", reply.id);

        Ok::<(), Box<dyn Error>>(())
    })
}
