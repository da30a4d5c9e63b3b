use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // Several TLS-speaking clients build rustls configs of their own; pin
    // the process-wide provider so they all agree.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    let code = surge::cli::run(cancel).await;
    std::process::exit(code);
}
