use clap::Parser;
use rudp::config::RudpConfig;
use rudp::end_point::{DeliveryOptions, EndPoint};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use tracing::{info, Level};

/// Sends a message to itself with confirmed delivery, pumping until it is received and acknowledged
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 6112)]
    port: u16,

    #[clap(long, default_value = "Hello, World!")]
    message: String,

    #[clap(long, default_value_t = 60)]
    max_cycles: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::TRACE } else { Level::INFO })
        .try_init()
        .ok();

    let addr: SocketAddr = ([127, 0, 0, 1], args.port).into();
    let end_point = EndPoint::bind(addr, Arc::new(RudpConfig::default())).await?;

    end_point.enqueue_message(args.message.as_bytes(), addr, 0, DeliveryOptions { confirm_delivery: true, in_order: false })?;

    let mut buf = vec![0u8; 64*1024];
    let mut num_received = 0;
    for _ in 0..args.max_cycles {
        end_point.update(Duration::from_millis(500)).await;

        while let Some(msg) = end_point.receive_message(&mut buf) {
            info!("received {:?} from {:?} on channel {}", String::from_utf8_lossy(&buf[..msg.len]), msg.from, msg.channel_id);
            num_received += 1;
        }

        if num_received > 0 && end_point.pending_ack_count() == 0 {
            info!("message was delivered and acknowledged");
            return Ok(());
        }
    }

    Err(anyhow!("no acknowledged delivery after {} cycles", args.max_cycles))
}
