//! Tail application logs from a traffic controller.
//!
//! Usage:
//! `cargo run --example tail_logs -- <endpoint> <app-guid>`
//!
//! The bearer token is read from `CF_AUTH_TOKEN`, e.g. the output of
//! `cf oauth-token`. Set `RUST_LOG=firehose_consumer=debug` to see dial and
//! retry events, including the handshake dumps.
//!
//! Behavior notes:
//! - Transient failures are printed and the stream reconnects on its own.
//! - Ctrl-C closes the consumer; the program exits once both channels drain.

use std::error::Error;
use std::sync::Arc;

use firehose_consumer::stream::envelope::MessageType;
use firehose_consumer::{Consumer, TracingDebugPrinter};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let endpoint = args
        .next()
        .unwrap_or_else(|| "wss://doppler.REPLACE_WITH_SYSTEM_DOMAIN:443".to_string());
    let app_guid = args
        .next()
        .unwrap_or_else(|| "REPLACE_WITH_APP_GUID".to_string());
    let auth_token = std::env::var("CF_AUTH_TOKEN").unwrap_or_default();

    let consumer = Consumer::new(endpoint, None, None);
    consumer.set_debug_printer(Arc::new(TracingDebugPrinter));
    consumer.set_on_connect_callback(Some(Arc::new(|| eprintln!("connected"))));

    let (mut logs, mut errors) = consumer
        .tailing_logs(&app_guid, SecretString::new(auth_token))
        .split();

    let closer = consumer.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(error) = closer.close().await {
                eprintln!("close failed: {error}");
            }
        }
    });

    let mut logs_open = true;
    let mut errors_open = true;
    while logs_open || errors_open {
        tokio::select! {
            log = logs.recv(), if logs_open => match log {
                Some(log) => {
                    let stream = match MessageType::try_from(log.message_type) {
                        Ok(MessageType::Err) => "ERR",
                        _ => "OUT",
                    };
                    println!(
                        "[{}/{}] {stream} {}",
                        log.source_type.as_deref().unwrap_or("?"),
                        log.source_instance.as_deref().unwrap_or("?"),
                        String::from_utf8_lossy(&log.message)
                    );
                }
                None => logs_open = false,
            },
            error = errors.recv(), if errors_open => match error {
                Some(error) if error.is_retryable() => eprintln!("reconnecting: {error}"),
                Some(error) => eprintln!("stream failed: {error}"),
                None => errors_open = false,
            },
        }
    }
    Ok(())
}
