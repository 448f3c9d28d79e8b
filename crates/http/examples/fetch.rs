//! Issues one GET against a host given on the command line and prints the
//! parsed response.
//!
//! ```sh
//! cargo run --example fetch -- example.com /
//! ```

use std::time::Duration;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use tether_http::connection::{HttpConnection, HttpOptions};
use tether_http::query::{QueryFlags, QueryStatus};
use tether_net::transport::Transport;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "example.com".to_string());
    let path = args.next().unwrap_or_else(|| "/".to_string());

    let transport = Transport::builder().build();
    let connection = HttpConnection::open(&transport, &host, 80, HttpOptions::default());

    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    connection.add_query(request.into_bytes(), QueryFlags::retry(), |status, response| {
        match (status, response) {
            (QueryStatus::Success, Some(response)) => {
                println!("{:?} {}", response.head().version(), response.status());
                for (name, value) in response.head().headers() {
                    println!("{name}: {}", value.to_str().unwrap_or("<binary>"));
                }
                println!();
                println!("{}", String::from_utf8_lossy(response.body()));
            }
            (status, _) => eprintln!("query failed: {status:?}"),
        }
    });

    while connection.query_count() > 0 {
        transport.wait(Duration::from_millis(100)).await;
        connection.process();
    }

    connection.close();
    transport.shutdown();
}
