use std::net::{SocketAddr, TcpListener};
use std::thread;

use axum::Router;
use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use tower_http::services::{ServeDir, ServeFile};
use tracing::info;

/// A running HTTP server. The server stops together with the process.
pub struct ServerHandle {
    port: u16,
    thread: thread::JoinHandle<Result<(), anyhow::Error>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Blocks until the server thread exits.
    pub fn join(self) -> anyhow::Result<()> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("HTTP server thread panicked")),
        }
    }
}

/// Serves `dist` on `port`. Paths that don't match a file get `fallback`, so
/// that client-side routes resolve to the entry document.
///
/// The socket is bound before this returns, a taken port is reported to the
/// caller rather than from the server thread.
pub fn start(dist: &Utf8Path, fallback: &Utf8Path, port: u16) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();

    info!(url = %style(format!("http://localhost:{port}/")).yellow(), "starting a HTTP server");

    let router = router(dist, fallback);
    let thread = thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve(listener, router))
    });

    Ok(ServerHandle { port, thread })
}

fn router(dist: &Utf8Path, fallback: &Utf8Path) -> Router {
    let index: Utf8PathBuf = dist.join(fallback);

    Router::new()
        .fallback_service(ServeDir::new(dist).fallback(ServeFile::new(index)))
}

async fn serve(listener: TcpListener, router: Router) -> Result<(), anyhow::Error> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    axum::serve(listener, router).await?;

    Ok(())
}
