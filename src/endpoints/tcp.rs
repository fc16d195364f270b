//! TCP listener endpoints.
//!
//! A listener endpoint is the router's face toward chart plotters and
//! navigation software: every connected client receives the sentence
//! stream routed to the endpoint's name, and anything a client sends back
//! is matched against the listener's route list and forwarded like any
//! other source. Clients are matched immediately; resolution is a serial
//! concern.

use crate::endpoint_core::{run_reader, EndpointCore, SentenceReader};
use crate::error::{Result, RouterError};
use crate::matcher_manager::build_full_matcher;
use crate::route::Route;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Per-client queue depth; a stalled client drops sentences rather than
/// stalling the router.
const CLIENT_QUEUE: usize = 64;

pub struct TcpCtx {
    pub core: EndpointCore,
    pub port: u16,
    pub routes: Vec<Arc<Route>>,
    pub rx: mpsc::Receiver<Bytes>,
}

pub async fn run(ctx: TcpCtx) -> Result<()> {
    let TcpCtx {
        core,
        port,
        routes,
        mut rx,
    } = ctx;
    let token = core.handle.cancel.clone();
    let name = core.handle.name.clone();

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| RouterError::network(&name, e))?;
    info!("{}: TCP listener on port {}", name, port);

    let clients: Arc<Mutex<Vec<mpsc::Sender<Bytes>>>> = Arc::new(Mutex::new(Vec::new()));

    let fanout_clients = clients.clone();
    let fanout = async move {
        while let Some(msg) = rx.recv().await {
            fanout_clients.lock().retain(|tx| {
                match tx.try_send(msg.clone()) {
                    Ok(()) => true,
                    // slow client: drop this sentence, keep the client
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
    };

    let mut join_set = JoinSet::new();
    let accept = async {
        loop {
            tokio::select! {
                accept_res = listener.accept() => match accept_res {
                    Ok((stream, addr)) => {
                        info!("{}: client connected from {}", name, addr);
                        let (client_tx, client_rx) = mpsc::channel(CLIENT_QUEUE);
                        clients.lock().push(client_tx);
                        let core = core.clone();
                        let routes = routes.clone();
                        let client_token = token.clone();
                        join_set.spawn(async move {
                            if let Err(e) =
                                client_session(stream, client_rx, core, routes, client_token).await
                            {
                                debug!("client session ended: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("{}: accept error: {}", name, e),
                },
                _ = join_set.join_next(), if !join_set.is_empty() => {}
            }
        }
    };

    tokio::select! {
        _ = accept => Ok(()),
        _ = fanout => Ok(()),
        _ = token.cancelled() => Ok(()),
    }
}

async fn client_session(
    stream: TcpStream,
    mut rx: mpsc::Receiver<Bytes>,
    core: EndpointCore,
    routes: Vec<Arc<Route>>,
    token: CancellationToken,
) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| RouterError::network(core.name(), e))?;
    let (reader, mut writer) = stream.into_split();

    // all clients of one listener share the endpoint's counters
    let mut sreader = build_full_matcher(&routes, core.handle.counters.clone())
        .map(SentenceReader::new);

    let read_core = core.clone();
    let read_token = token.clone();
    let read_loop = async move {
        match &mut sreader {
            Some(sreader) => run_reader(reader, sreader, &read_core, &read_token).await,
            None => {
                // no routes: swallow client input so the connection stays up
                use tokio::io::AsyncReadExt;
                let mut reader = reader;
                let mut buf = [0u8; 1024];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) => return Ok(()),
                        Ok(n) => read_core.handle.stats.record_read(n),
                        Err(e) => return Err(RouterError::network(read_core.name(), e)),
                    }
                }
            }
        }
    };

    let write_core = core.clone();
    let write_loop = async move {
        while let Some(msg) = rx.recv().await {
            writer
                .write_all(&msg)
                .await
                .map_err(|e| RouterError::network(write_core.name(), e))?;
            write_core.handle.stats.record_write(msg.len());
        }
        Ok(())
    };

    tokio::select! {
        res = read_loop => res,
        res = write_loop => res,
        _ = token.cancelled() => Ok(()),
    }
}
