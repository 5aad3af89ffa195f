//! Engine daemon runtime: TCP listener plus the single-writer decision loop.
//!
//! Network tasks never touch class state. Each connection task decodes
//! requests and forwards them over a bounded queue to one dedicated decision
//! thread that owns the [`Engine`] and the [`Journal`]; the journal sync is
//! the only blocking step and serializes all commits. Replies travel back on
//! per-request oneshot channels, and each connection writes them strictly in
//! the order it read the requests.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::{Engine, RecoveryError};
use crate::journal::{self, Journal, JournalError};
use crate::model::{GrantRecord, GrantRequest};
use crate::wire::{Denial, EngineCodec, GrantReply};

/// Why the daemon stopped.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("journal corruption: {0}")]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("journal write failed: {0}")]
    JournalFault(JournalError),
}

impl ServeError {
    /// Process exit code: 2 for refusing to start, 3 for a runtime journal
    /// fault, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServeError::Config(_) | ServeError::Journal(_) | ServeError::Recovery(_) => 2,
            ServeError::JournalFault(_) => 3,
            ServeError::Io(_) => 1,
        }
    }
}

/// One queued grant decision: the request plus the channel its reply rides
/// back on.
struct GrantJob {
    request: GrantRequest,
    reply: oneshot::Sender<GrantReply>,
}

#[derive(Debug, Error)]
#[error("engine is shutting down")]
struct EngineClosed;

/// Cloneable sender side of the decision queue, held by connection tasks.
#[derive(Clone)]
struct EngineHandle {
    jobs: mpsc::Sender<GrantJob>,
}

impl EngineHandle {
    async fn grant(&self, request: GrantRequest) -> Result<GrantReply, EngineClosed> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(GrantJob { request, reply: tx })
            .await
            .map_err(|_| EngineClosed)?;
        rx.await.map_err(|_| EngineClosed)
    }
}

/// Recover state from the journal, bind the listener, and serve until a
/// shutdown signal or a fatal journal fault.
pub async fn run(config: EngineConfig) -> Result<(), ServeError> {
    let mut engine = build_engine(&config)?;

    let replay = journal::replay(&config.journal)?;
    if let Some(offset) = replay.truncated_tail {
        warn!(offset, "journal tail was torn and has been truncated");
    }
    let stats = engine.recover(replay.records)?;
    info!(records = stats.records, "journal replayed");
    let journal = Journal::open(&config.journal)?;

    let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_depth);
    let (fault_tx, fault_rx) = oneshot::channel();
    thread::Builder::new()
        .name("cert-writer".to_string())
        .spawn(move || {
            if let Err(err) = decision_loop(engine, journal, jobs_rx) {
                let _ = fault_tx.send(err);
            }
        })?;

    let listener = TcpListener::bind(config.listen).await?;
    info!(addr = %listener.local_addr()?, "engine listening");

    let handle = EngineHandle { jobs: jobs_tx };
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);

    tokio::select! {
        fault = fault_rx => match fault {
            Ok(err) => Err(ServeError::JournalFault(err)),
            // Sender dropped without a fault: the writer exited cleanly.
            Err(_) => Ok(()),
        },
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
        _ = accept_loop(listener, handle, idle_timeout) => Ok(()),
    }
}

fn build_engine(config: &EngineConfig) -> Result<Engine, ServeError> {
    let mut seen = HashSet::new();
    for (tag, _) in &config.classes {
        if !seen.insert(tag.as_str()) {
            return Err(ServeError::Config(format!("duplicate class tag '{tag}'")));
        }
    }
    Ok(Engine::new(config.classes.iter().cloned()))
}

/// The single writer. Every accepted grant is journaled and synced before
/// state moves or the reply leaves; a journal failure fails the remaining
/// queue and takes the process down rather than let memory drift from disk.
fn decision_loop(
    mut engine: Engine,
    mut journal: Journal,
    mut jobs: mpsc::Receiver<GrantJob>,
) -> Result<(), JournalError> {
    while let Some(job) = jobs.blocking_recv() {
        let number = match engine.check(&job.request) {
            Err(err) => {
                info!(
                    class = %job.request.class,
                    amount = job.request.amount,
                    reason = %err,
                    "grant rejected"
                );
                let _ = job.reply.send(GrantReply::Denied(Denial::from(&err)));
                continue;
            }
            Ok(number) => number,
        };

        let record = GrantRecord::new(
            job.request.class.clone(),
            number,
            job.request.amount,
            job.request.holder.clone(),
        );
        if let Err(err) = journal.append(&record) {
            error!(%err, "journal append failed, shutting down");
            let _ = job.reply.send(GrantReply::Denied(Denial::EngineFault));
            fail_pending(&mut jobs);
            return Err(err);
        }

        engine.commit(&job.request);
        info!(
            class = %record.class,
            cert = record.number,
            amount = record.amount,
            "grant committed"
        );
        let _ = job.reply.send(GrantReply::Granted(number));
    }
    Ok(())
}

fn fail_pending(jobs: &mut mpsc::Receiver<GrantJob>) {
    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        let _ = job.reply.send(GrantReply::Denied(Denial::EngineFault));
    }
}

async fn accept_loop(listener: TcpListener, handle: EngineHandle, idle_timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let handle = handle.clone();
                tokio::spawn(serve_connection(stream, peer, handle, idle_timeout));
            }
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Serve one connection until EOF, idle timeout, or a framing error.
/// Requests are handled one at a time, so replies leave in request order.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handle: EngineHandle,
    idle_timeout: Duration,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, %err, "set_nodelay failed");
    }
    let mut framed = Framed::new(stream, EngineCodec);
    debug!(%peer, "connection open");

    loop {
        let request = match timeout(idle_timeout, framed.next()).await {
            Err(_) => {
                debug!(%peer, "closing idle connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                warn!(%peer, %err, "malformed frame, closing connection");
                break;
            }
            Ok(Some(Ok(request))) => request,
        };

        let (reply, engine_down) = match handle.grant(request).await {
            Ok(reply) => (reply, false),
            Err(EngineClosed) => (GrantReply::Denied(Denial::EngineFault), true),
        };
        if let Err(err) = framed.send(reply).await {
            debug!(%peer, %err, "reply write failed");
            break;
        }
        if engine_down {
            break;
        }
    }
    debug!(%peer, "connection closed");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
