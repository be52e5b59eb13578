//! Telling open browser tabs that a rebuild finished.

/// Signalled once after every watched rebuild that completed successfully.
pub trait ReloadNotifier: Send + Sync {
    fn reload(&self);
}

impl<F> ReloadNotifier for F
where
    F: Fn() + Send + Sync,
{
    fn reload(&self) {
        self()
    }
}

#[cfg(feature = "live")]
pub use socket::WebSocketReload;

#[cfg(feature = "live")]
mod socket {
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc::Sender;
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    use tungstenite::WebSocket;

    use super::ReloadNotifier;

    type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

    /// Broadcasts `"reload"` to every browser connected over WebSocket.
    ///
    /// Two threads back it: one accepting connections, one sending the
    /// message whenever [`ReloadNotifier::reload`] is called.
    pub struct WebSocketReload {
        port: u16,
        sender: Mutex<Sender<()>>,
        _threads: (JoinHandle<()>, JoinHandle<()>),
    }

    impl WebSocketReload {
        /// Binds the socket on `port`, or on any free port if that one is
        /// taken.
        pub fn start(port: u16) -> std::io::Result<Self> {
            let (tcp, port) = reserve_port(port)?;
            let clients = Clients::default();

            let incoming = new_thread_ws_incoming(tcp, clients.clone());
            let (sender, outgoing) = new_thread_ws_reload(clients);

            tracing::debug!(port, "live reload socket is listening");

            Ok(Self {
                port,
                sender: Mutex::new(sender),
                _threads: (incoming, outgoing),
            })
        }

        pub fn port(&self) -> u16 {
            self.port
        }
    }

    impl ReloadNotifier for WebSocketReload {
        fn reload(&self) {
            if self.sender.lock().unwrap().send(()).is_err() {
                tracing::error!("live reload thread has stopped");
            }
        }
    }

    fn reserve_port(port: u16) -> std::io::Result<(TcpListener, u16)> {
        let listener = match TcpListener::bind(("127.0.0.1", port)) {
            Ok(sock) => sock,
            Err(_) => TcpListener::bind("127.0.0.1:0")?,
        };

        let addr = listener.local_addr()?;
        let port = addr.port();
        Ok((listener, port))
    }

    fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
        std::thread::spawn(move || {
            for stream in server.incoming() {
                let Ok(stream) = stream else {
                    continue;
                };
                let socket = match tungstenite::accept(stream) {
                    Ok(socket) => socket,
                    Err(e) => {
                        tracing::warn!("live reload handshake failed: {e}");
                        continue;
                    }
                };
                clients.lock().unwrap().push(socket);
            }
        })
    }

    /// Most browser tabs kept connected at once; older ones are closed
    /// first.
    const MAX_CLIENTS: usize = 10;

    fn new_thread_ws_reload(clients: Clients) -> (Sender<()>, JoinHandle<()>) {
        let (tx, rx) = std::sync::mpsc::channel();

        let thread = std::thread::spawn(move || {
            while rx.recv().is_ok() {
                let mut clients = clients.lock().unwrap();

                clients.retain_mut(|socket| match socket.send("reload".into()) {
                    Ok(()) => true,
                    Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => false,
                    Err(tungstenite::Error::Io(e)) => {
                        tracing::debug!("dropping live reload client: {e}");
                        false
                    }
                    Err(e) => {
                        tracing::warn!("couldn't send reload to a browser tab: {e}");
                        true
                    }
                });

                let stale = clients.len().saturating_sub(MAX_CLIENTS);
                for mut socket in clients.drain(..stale) {
                    socket.close(None).ok();
                }

                tracing::debug!(clients = clients.len(), "sent live reload");
            }
        });

        (tx, thread)
    }

}
