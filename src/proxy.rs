//! HTTP and HTTPS listeners.
//!
//! Each accepted socket gets a connection id and its own task; requests on
//! it flow through the dispatcher pipeline. The TLS listener defers
//! configuration until the ClientHello arrives so the certificate for the
//! SNI name can be fetched (and issued, on first sight) per connection.

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info};

use crate::cert::{CertStore, SingleCertResolver};
use crate::dispatcher::Dispatcher;

/// One listening socket, plain or TLS.
pub struct GateServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
    certs: Option<Arc<CertStore>>,
}

impl GateServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher,
            shutdown_rx,
            certs: None,
        }
    }

    pub fn with_tls(mut self, certs: Arc<CertStore>) -> Self {
        self.certs = Some(certs);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.certs.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let certs = self.certs.clone();
                            let connection_id = dispatcher.next_connection_id();

                            tokio::spawn(async move {
                                let local = match stream.local_addr() {
                                    Ok(local) => local,
                                    Err(err) => {
                                        debug!(remote = %remote, error = %err, "no local address");
                                        return;
                                    }
                                };

                                let result = match certs {
                                    Some(certs) => {
                                        handle_tls_connection(
                                            stream, remote, local, connection_id, dispatcher, certs,
                                        )
                                        .await
                                    }
                                    None => {
                                        serve_connection(
                                            stream, remote, local, false, connection_id, dispatcher,
                                        )
                                        .await
                                    }
                                };
                                if let Err(err) = result {
                                    debug!(remote = %remote, error = %err, "connection error");
                                }
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %self.bind_addr, "listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Read the ClientHello, resolve the SNI certificate, and finish the
/// handshake with a connection-specific config. Failures end only this
/// connection.
async fn handle_tls_connection(
    stream: TcpStream,
    remote: SocketAddr,
    local: SocketAddr,
    connection_id: u64,
    dispatcher: Arc<Dispatcher>,
    certs: Arc<CertStore>,
) -> anyhow::Result<()> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor.await?;

    let servername = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("client sent no SNI servername"))?;

    let key = certs
        .certified_key(&servername)
        .await
        .ok_or_else(|| anyhow::anyhow!("no certificate for {servername}"))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SingleCertResolver(key)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let tls_stream = start.into_stream(Arc::new(config)).await?;
    serve_connection(tls_stream, remote, local, true, connection_id, dispatcher).await
}

async fn serve_connection<S>(
    stream: S,
    remote: SocketAddr,
    local: SocketAddr,
    is_tls: bool,
    connection_id: u64,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            dispatcher
                .handle_request(req, remote, local, is_tls, connection_id)
                .await
        }
    });

    // auto::Builder serves HTTP/1.1 (with upgrades) and HTTP/2 on one port.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

    Ok(())
}
