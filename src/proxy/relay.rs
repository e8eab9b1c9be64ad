use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slog::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::buffer::Lane;
use crate::crypto::Cipher;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// client -> backend, decrypting
    Upload,
    /// backend -> client, encrypting
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Everything one direction of a session owns.
pub struct Leg<R, W> {
    pub reader: R,
    pub writer: W,
    pub cipher: Cipher,
    pub lane: Lane,
}

/// How a direction ended.
#[derive(Debug)]
pub struct Outcome {
    pub bytes: u64,
    pub grown_to: usize,
    /// Whether this direction was the one that finalized its cipher.
    pub cipher_finished: bool,
    pub error: Option<anyhow::Error>,
}

/// Shared by the two directions of a session. Whichever finishes first
/// triggers it, which stops the other.
struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Shutdown { tx }
    }

    /// Returns `true` only for the first caller.
    fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|down| *down).await;
    }
}

/// Last time either direction of a session moved bytes.
struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Activity {
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// How much longer the session may stay quiet before `idle` runs out.
    fn remaining(&self, idle: Duration) -> Duration {
        idle.saturating_sub(self.last.lock().elapsed())
    }
}

/// Sends the download IV to the client, then pumps both directions until
/// either one ends. The session times out only once neither direction has
/// moved bytes for `idle`. Every buffer and cipher is released by the time
/// this returns, on every path.
pub async fn relay<CR, CW, BR, BW>(
    logger: &slog::Logger,
    idle: Duration,
    upload: Leg<CR, BW>,
    mut download: Leg<BR, CW>,
) -> anyhow::Result<(Outcome, Outcome)>
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    BR: AsyncRead + Unpin + Send + 'static,
    BW: AsyncWrite + Unpin + Send + 'static,
{
    let iv = download.cipher.iv().to_vec();
    io_timeout(idle, download.writer.write_all(&iv)).await?;

    let shutdown = Arc::new(Shutdown::new());
    let activity = Arc::new(Activity::new());
    let up = tokio::spawn(pump(
        logger.clone(),
        Direction::Upload,
        upload,
        idle,
        shutdown.clone(),
        activity.clone(),
    ));
    let down = tokio::spawn(pump(
        logger.clone(),
        Direction::Download,
        download,
        idle,
        shutdown,
        activity,
    ));
    let (up, down) = tokio::join!(up, down);
    Ok((up?, down?))
}

async fn pump<R, W>(
    logger: slog::Logger,
    direction: Direction,
    mut leg: Leg<R, W>,
    idle: Duration,
    shutdown: Arc<Shutdown>,
    activity: Arc<Activity>,
) -> Outcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let logger = logger.new(slog::o!("direction" => direction.to_string()));
    let mut bytes = 0u64;
    let result = tokio::select! {
        r = copy(&logger, direction, &mut leg, idle, &activity, &mut bytes) => r,
        _ = shutdown.wait() => Ok(()),
    };
    if shutdown.trigger() {
        let err = result.as_ref().err().map(|e| e.to_string());
        debug!(logger, "closing session"; "err" => err);
    }

    let _ = leg.writer.shutdown().await;
    let grown_to = leg.lane.capacity();
    let cipher_finished = leg.cipher.finish();
    leg.lane.src.release();
    leg.lane.dst.release();
    Outcome {
        bytes,
        grown_to,
        cipher_finished,
        error: result.err(),
    }
}

async fn copy<R, W>(
    logger: &slog::Logger,
    direction: Direction,
    leg: &mut Leg<R, W>,
    idle: Duration,
    activity: &Activity,
    bytes: &mut u64,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // bytes that arrived together with the request header
    if !leg.lane.src.is_empty() {
        *bytes += forward(direction, leg, idle).await?;
        activity.touch();
    }
    loop {
        let n = read_while_active(&mut leg.reader, leg.lane.src.unfilled_mut(), idle, activity)
            .await?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();
        leg.lane.src.advance(n);
        if leg.lane.record_read(n) {
            info!(logger, "expand buffer size"; "size" => leg.lane.capacity());
        }
        *bytes += forward(direction, leg, idle).await?;
        activity.touch();
    }
}

/// Reads into `buf`, waiting as long as the other direction keeps the
/// session active.
async fn read_while_active<R>(
    reader: &mut R,
    buf: &mut [u8],
    idle: Duration,
    activity: &Activity,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    loop {
        let remaining = activity.remaining(idle);
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("idle for {idle:?}"),
            ));
        }
        if let Ok(r) = tokio::time::timeout(remaining, reader.read(buf)).await {
            return r;
        }
    }
}

/// Transforms everything in `src` into `dst` and writes it out.
async fn forward<R, W>(
    direction: Direction,
    leg: &mut Leg<R, W>,
    idle: Duration,
) -> anyhow::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let lane = &mut leg.lane;
    match direction {
        Direction::Upload => leg.cipher.decrypt_buf(&mut lane.src, &mut lane.dst)?,
        Direction::Download => leg.cipher.encrypt_buf(&mut lane.src, &mut lane.dst)?,
    }
    io_timeout(idle, leg.writer.write_all(lane.dst.filled())).await?;
    let n = lane.dst.len() as u64;
    lane.dst.clear();
    Ok(n)
}

async fn io_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("idle for {limit:?}"),
        )),
    }
}
