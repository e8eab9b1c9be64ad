use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use slog::debug;
use tokio::net::lookup_host;

use crate::geoip::RegionClassifier;
use crate::proxy::handshake::Request;
use crate::proxy::*;

/// Public resolver that LAN clients tend to hard-code.
pub const PUBLIC_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Connect straight to this address; no SOCKS5 negotiation.
    Direct(SocketAddr),
    /// Tunnel through the SOCKS5 backend with the request as the client sent it.
    Backend,
}

pub struct Router {
    logger: slog::Logger,
    classifier: Option<Arc<dyn RegionClassifier>>,
    dns_redirect: IpAddr,
    resolve_timeout: Duration,
}

impl Router {
    pub fn new(
        logger: slog::Logger,
        classifier: Option<Arc<dyn RegionClassifier>>,
        dns_redirect: IpAddr,
        resolve_timeout: Duration,
    ) -> Self {
        Router {
            logger,
            classifier,
            dns_redirect,
            resolve_timeout,
        }
    }

    pub async fn route(&self, request: &Request) -> Route {
        let route = match &request.address {
            Address::IPv4(ip) if Ipv4Addr::from(*ip) == PUBLIC_DNS => {
                Route::Direct(SocketAddr::new(self.dns_redirect, request.port))
            }
            Address::Domain(name) => match self.resolve(name, request.port).await {
                Some(resolved) => self.classify(resolved.ip(), request.port),
                None => Route::Backend,
            },
            address => match address.ip() {
                Some(ip) => self.classify(ip, request.port),
                None => Route::Backend,
            },
        };
        debug!(self.logger, "route";
            "destination" => %request.address, "port" => request.port, "route" => ?route);
        route
    }

    fn classify(&self, ip: IpAddr, port: u16) -> Route {
        let local = self
            .classifier
            .as_ref()
            .map_or(false, |c| c.is_local(ip));
        if local {
            Route::Direct(SocketAddr::new(ip, port))
        } else {
            Route::Backend
        }
    }

    // Failing to resolve here is not fatal; the backend resolves on its own.
    async fn resolve(&self, name: &[u8], port: u16) -> Option<SocketAddr> {
        let host = std::str::from_utf8(name).ok()?;
        match tokio::time::timeout(self.resolve_timeout, lookup_host((host, port))).await {
            Ok(Ok(mut addrs)) => addrs.next(),
            Ok(Err(e)) => {
                debug!(self.logger, "resolve failed"; "host" => host, "err" => %e);
                None
            }
            Err(_) => {
                debug!(self.logger, "resolve timed out";
                    "host" => host, "limit" => ?self.resolve_timeout);
                None
            }
        }
    }
}
