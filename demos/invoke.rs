//! Invoke - calling an hprose service.
//!
//! This example demonstrates:
//! - Building a client with the fluent builder
//! - Plain and by-reference calls
//! - Batching several calls into one request
//!
//! # Running
//!
//! Start any hprose server exposing `hello` and `swap`, then:
//!
//! ```sh
//! RUST_LOG=hprose_client=debug cargo run --example invoke -- tcp://127.0.0.1:4321
//! ```

use hprose_client::{BatchOptions, Client, InvokeOptions, Value};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8080/".to_string());

    let client = Client::builder()
        .uri(uri)
        .idempotent(true)
        .retry(3)
        .timeout(5_000)
        .build()?;

    let greeting = client.invoke("hello", vec![Value::from("world")]).await?;
    println!("hello -> {greeting:?}");

    // The server may rewrite by-reference arguments.
    let reply = client
        .invoke_with(
            "swap",
            vec![Value::from(1), Value::from(2)],
            InvokeOptions::new().byref(true),
        )
        .await?;
    println!("swap -> {:?}", reply.args);

    client.begin_batch();
    let names = ["alice", "bob", "carol"];
    for name in names {
        // Each call also settles on its own; only the batch result is used here.
        drop(client.invoke("hello", vec![Value::from(name)]));
    }
    for item in client.end_batch(BatchOptions::new()).await? {
        match item.error {
            Some(message) => println!("{} failed: {message}", item.name),
            None => println!("{} -> {:?}", item.name, item.result),
        }
    }

    client.close();
    Ok(())
}
