use std::error::Error;

use duet::participant::{
    Call, DeviceInventory, NegotiationError, NegotiationState, ParticipantConfig,
    RtcPeerConnectionFactory,
};
use duet::signaling::{DEFAULT_SIGNALING_PORT, RoomId};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (url, room) = match (args.next(), args.next()) {
        (Some(url), Some(room)) => (url, room),
        (Some(room), None) => (format!("ws://127.0.0.1:{}", DEFAULT_SIGNALING_PORT), room),
        _ => {
            eprintln!("usage: duet-peer [ws-url] <room-id>");
            std::process::exit(2);
        }
    };

    let config = ParticipantConfig::default();
    let factory = RtcPeerConnectionFactory::new(&config.ice_servers)?;
    let media = DeviceInventory::new(true, true);

    println!("Joining room {} via {}", room, url);

    let call = Call::join(&url, RoomId::from(room), factory, media, config).await?;
    let mut states = call.subscribe();
    tokio::spawn(async move {
        let connected = states
            .wait_for(|state| *state == NegotiationState::Connected)
            .await
            .is_ok();
        if connected {
            println!("Call connected, press Ctrl-C to hang up");
        }
    });

    match call.run().await {
        Ok(state) => println!("Call finished in state {:?}", state),
        Err(NegotiationError::RoomFull) => println!("The room is full, please try another one"),
        Err(e) => println!("Call ended: {}", e),
    }

    Ok(())
}
