use duet::signaling::{SignalingServer, port_from_env};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let bind_addr = format!("0.0.0.0:{}", port_from_env());

    println!("   Duet Signaling Relay");
    println!("   Binding to {}", bind_addr);
    println!("   Press Ctrl+C to stop\n");

    let server = SignalingServer::new();
    server.run(&bind_addr).await
}
