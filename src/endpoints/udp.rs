//! Datagram endpoints.
//!
//! A `datagram` endpoint binds the NMEA port, routes whatever valid
//! sentences arrive on it and sends queued output to its configured peer.
//! A `broadcast` endpoint is the same socket aimed at 255.255.255.255,
//! the conventional way to flood instrument data onto a boat network.
//! Both are matched from birth; only serial ports need resolution.

use crate::endpoint_core::{EndpointCore, SentenceReader};
use crate::error::{Result, RouterError};
use crate::matcher_manager::build_full_matcher;
use crate::route::Route;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct UdpCtx {
    pub core: EndpointCore,
    /// Peer address; `None` means limited broadcast.
    pub address: Option<String>,
    pub port: u16,
    pub routes: Vec<Arc<Route>>,
    pub rx: mpsc::Receiver<Bytes>,
}

pub async fn run(ctx: UdpCtx) -> Result<()> {
    let UdpCtx {
        core,
        address,
        port,
        routes,
        mut rx,
    } = ctx;
    let token = core.handle.cancel.clone();
    let name = core.handle.name.clone();

    let target_ip: IpAddr = match &address {
        Some(addr) => addr
            .parse()
            .map_err(|_| RouterError::config(format!("{name}: bad address '{addr}'")))?,
        None => IpAddr::V4(Ipv4Addr::BROADCAST),
    };
    let target = SocketAddr::new(target_ip, port);

    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|e| RouterError::network(&name, e))?;
    if is_broadcast(target_ip) {
        socket
            .set_broadcast(true)
            .map_err(|e| RouterError::network(&name, e))?;
    }
    let socket = Arc::new(socket);
    info!("{}: datagram endpoint on port {} -> {}", name, port, target);

    let mut sreader =
        build_full_matcher(&routes, core.handle.counters.clone()).map(SentenceReader::new);

    let recv_socket = socket.clone();
    let recv_core = core.clone();
    let recv_loop = async move {
        let mut buf = [0u8; 2048];
        loop {
            match recv_socket.recv_from(&mut buf).await {
                Ok((len, _peer)) => {
                    recv_core.handle.stats.record_read(len);
                    match &mut sreader {
                        Some(sreader) => recv_core.process(sreader, &buf[..len]),
                        // no routes: a pure sink; input only feeds an
                        // attached console, if any
                        None => {
                            if let Some(sink) = recv_core.handle.attachment() {
                                let _ = sink.try_send(Bytes::copy_from_slice(&buf[..len]));
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("{}: recv error: {}", recv_core.name(), e);
                }
            }
        }
    };

    let send_socket = socket;
    let stats = core.handle.stats.clone();
    let send_name = name.clone();
    let send_loop = async move {
        while let Some(msg) = rx.recv().await {
            match send_socket.send_to(&msg, target).await {
                Ok(n) => stats.record_write(n),
                Err(e) => debug!("{}: send error: {}", send_name, e),
            }
        }
    };

    tokio::select! {
        _ = recv_loop => Ok(()),
        _ = send_loop => Ok(()),
        _ = token.cancelled() => Ok(()),
    }
}

fn is_broadcast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_broadcast() || v4.octets()[3] == 255,
        IpAddr::V6(_) => false,
    }
}
