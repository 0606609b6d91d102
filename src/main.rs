//! `tramp-rpc-server` — remote-side RPC server for editor-integrated
//! remote file access.
//!
//! The binary is started on the remote host by the client collaborator
//! (typically over a secure-shell session) and speaks a length-prefixed
//! MessagePack protocol on stdin/stdout. Stderr carries diagnostics only;
//! the protocol never touches it.
//!
//! The server holds no persisted state and is restarted per session: when
//! stdin reaches EOF the connection is torn down and the process exits.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tramp_rpc_server::config::Config;
use tramp_rpc_server::server;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // All diagnostics go to stderr; stdout belongs to the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    // Machine-readable startup line: the bootstrap side waits for it to
    // confirm the server came up. Exact format matters.
    eprintln!("tramp-rpc-server {} ready", env!("CARGO_PKG_VERSION"));

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    server::serve(stdin, stdout, config).await;

    tracing::info!("session ended, exiting");
}
