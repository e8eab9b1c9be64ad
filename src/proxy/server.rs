use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use slog::{debug, info, o};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::buffer::{BufferPool, Lane};
use crate::config::Config;
use crate::crypto::{Cipher, CipherMode};
use crate::geoip::{GeoIp, RegionClassifier};
use crate::proxy::handshake::read_request;
use crate::proxy::relay::{relay, Leg};
use crate::proxy::router::Route;
use crate::proxy::*;

/// State shared by every connection.
pub struct Context {
    pub mode: CipherMode,
    pub key: Vec<u8>,
    pub backend_addr: String,
    pub backend_port: u16,
    pub router: Router,
    pub pool: BufferPool,
    pub timeouts: Timeouts,
}

pub struct Server {
    pub logger: slog::Logger,
    pub listen_addr: String,
    pub listen_port: u16,
    ctx: Arc<Context>,
}

impl Server {
    pub fn new(logger: slog::Logger, config: &Config) -> anyhow::Result<Self> {
        let mode = config.cipher_mode()?;
        let channel = &config.security_channel;
        let classifier: Option<Arc<dyn RegionClassifier>> =
            match (channel.geoip, &channel.geoip_database_file_path) {
                (true, Some(path)) => {
                    info!(logger, "GeoIP enabled"; "db" => %path.display(), "region" => &channel.local_region);
                    Some(Arc::new(GeoIp::open(path, &channel.local_region)?))
                }
                _ => None,
            };
        let timeouts = config.timeouts();
        let router = Router::new(
            logger.clone(),
            classifier,
            channel.dns_redirect,
            timeouts.connect,
        );
        let pool = BufferPool::new(logger.clone(), config.buffer.size, config.buffer.pool_size);
        info!(logger, "buffer pool ready";
            "buffer_size" => pool.buffer_size(), "buffers" => pool.available());
        let ctx = Context {
            mode,
            key: mode.derive_key(&config.security.password),
            backend_addr: config.server.backend_addr.clone(),
            backend_port: config.server.backend_port,
            router,
            pool,
            timeouts,
        };
        Ok(Server {
            logger,
            listen_addr: config.server.ss_addr.clone(),
            listen_port: config.server.ss_port,
            ctx: Arc::new(ctx),
        })
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.listen_addr.as_str(), self.listen_port))
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind: {e}"))?;
        self.serve_on(listener).await
    }

    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(self.logger, "server started";
            "addr" => %listener.local_addr()?, "cipher" => %self.ctx.mode);
        info!(self.logger, "backend configured";
            "addr" => &self.ctx.backend_addr, "port" => self.ctx.backend_port);

        let mut conn_id = 0;
        loop {
            conn_id += 1;
            match listener.accept().await {
                Ok((conn, addr)) => {
                    let h = Handler {
                        logger: self.logger.new(o!("id" => conn_id)),
                        ctx: self.ctx.clone(),
                    };
                    tokio::spawn(h.handle(conn, addr));
                }
                Err(err) => {
                    slog::error!(self.logger, "failed to accept"; "err" => %err);
                }
            }
        }
    }
}

struct Handler {
    logger: slog::Logger,
    ctx: Arc<Context>,
}

impl Handler {
    async fn handle(self, client: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = client.set_nodelay(true) {
            slog::warn!(self.logger, "failed to set TCP_NODELAY"; "err" => %e);
        }
        if let Err(e) = self.handle_conn(client, client_addr).await {
            slog::error!(self.logger, "proxy failed"; "err" => %e);
        }
    }

    async fn handle_conn<S>(&self, client: S, client_addr: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let started_at = Instant::now();
        let ctx = &self.ctx;
        info!(self.logger, "proxy start"; "client_addr" => client_addr);

        let (mut client_reader, client_writer) = tokio::io::split(client);
        let mut upload = Lane::new(ctx.pool.get(), ctx.pool.get());
        let download = Lane::new(ctx.pool.get(), ctx.pool.get());

        let (request, read_cipher) = timed(
            ctx.timeouts.handshake,
            "request header",
            read_request(&mut client_reader, &mut upload.src, ctx.mode, &ctx.key),
        )
        .await?;
        debug!(self.logger, "request";
            "destination" => %request.address, "port" => request.port, "pending" => upload.src.len());

        let backend = match ctx.router.route(&request).await {
            Route::Direct(addr) => connect_to_upstream(addr, ctx.timeouts.connect).await?,
            Route::Backend => {
                let mut backend = connect_to_upstream(
                    (ctx.backend_addr.as_str(), ctx.backend_port),
                    ctx.timeouts.connect,
                )
                .await?;
                let (bound, bound_port) = timed(
                    ctx.timeouts.connect,
                    "backend handshake",
                    socks5::handle(&mut backend, &request),
                )
                .await?;
                debug!(self.logger, "backend bound"; "addr" => %bound, "port" => bound_port);
                backend
            }
        };

        let write_cipher = Cipher::encryptor(ctx.mode, &ctx.key)?;
        let (backend_reader, backend_writer) = backend.into_split();
        let (up, down) = relay(
            &self.logger,
            ctx.timeouts.idle,
            Leg {
                reader: client_reader,
                writer: backend_writer,
                cipher: read_cipher,
                lane: upload,
            },
            Leg {
                reader: backend_reader,
                writer: client_writer,
                cipher: write_cipher,
                lane: download,
            },
        )
        .await?;

        for (direction, outcome) in [("upload", &up), ("download", &down)] {
            debug!(self.logger, "relay finished";
                "direction" => direction,
                "buffer_size" => outcome.grown_to,
                "cipher_finished" => outcome.cipher_finished,
                "err" => outcome.error.as_ref().map(|e| e.to_string()),
            );
        }
        debug!(self.logger, "pool";
            "idle_buffers" => ctx.pool.available(),
            "extra_allocations" => ctx.pool.extra_allocations(),
            "releases" => ctx.pool.releases(),
        );
        let elapsed = started_at.elapsed();
        info!(self.logger, "proxy done";
            "downloaded_bytes" => down.bytes,
            "uploaded_bytes" => up.bytes,
            "elapsed" => ?elapsed,
        );
        Ok(())
    }
}
