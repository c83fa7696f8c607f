//! Per-connection call serialization.
//!
//! A terminal connection is a shared, non-reentrant resource. Each
//! connection gets exactly one worker task that owns the client and
//! executes calls one at a time in arrival order; every call is bounded
//! by a timeout. Callers hold a cheap, cloneable [`TerminalHandle`].

use super::error::TerminalError;
use super::traits::TerminalClient;
use super::types::{OpenRequest, PositionId, ProviderPosition};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Calls waiting behind the active one before senders are back-pressured.
const QUEUE_DEPTH: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, TerminalError>>;

enum TerminalCall {
    Snapshot {
        reply: Reply<Vec<ProviderPosition>>,
    },
    Open {
        request: OpenRequest,
        reply: Reply<PositionId>,
    },
    Modify {
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        reply: Reply<()>,
    },
    Close {
        position_id: PositionId,
        reply: Reply<()>,
    },
}

/// Handle to the worker owning one terminal connection.
#[derive(Clone)]
pub struct TerminalHandle {
    account_id: Arc<str>,
    tx: mpsc::Sender<TerminalCall>,
}

impl TerminalHandle {
    /// Spawn the worker task for `client` and return a handle to it.
    ///
    /// Must be called from within a tokio runtime. The worker stops once
    /// every handle has been dropped.
    pub fn spawn(
        account_id: impl Into<String>,
        client: Arc<dyn TerminalClient>,
        call_timeout: Duration,
    ) -> Self {
        let account_id: Arc<str> = Arc::from(account_id.into());
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run_worker(account_id.clone(), client, rx, call_timeout));
        Self { account_id, tx }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> TerminalCall,
    ) -> Result<T, TerminalError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| self.worker_gone())?;
        reply_rx.await.map_err(|_| self.worker_gone())?
    }

    fn worker_gone(&self) -> TerminalError {
        TerminalError::Disconnected(format!("worker for {} has stopped", self.account_id))
    }
}

#[async_trait]
impl TerminalClient for TerminalHandle {
    async fn snapshot(&self) -> Result<Vec<ProviderPosition>, TerminalError> {
        self.call(|reply| TerminalCall::Snapshot { reply }).await
    }

    async fn open(&self, request: &OpenRequest) -> Result<PositionId, TerminalError> {
        let request = request.clone();
        self.call(|reply| TerminalCall::Open { request, reply }).await
    }

    async fn modify(
        &self,
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), TerminalError> {
        self.call(|reply| TerminalCall::Modify {
            position_id,
            stop_loss,
            take_profit,
            reply,
        })
        .await
    }

    async fn close(&self, position_id: PositionId) -> Result<(), TerminalError> {
        self.call(|reply| TerminalCall::Close { position_id, reply })
            .await
    }
}

async fn run_worker(
    account_id: Arc<str>,
    client: Arc<dyn TerminalClient>,
    mut rx: mpsc::Receiver<TerminalCall>,
    call_timeout: Duration,
) {
    debug!(account = %account_id, "Terminal worker started");

    while let Some(call) = rx.recv().await {
        // A dropped reply receiver only means the caller gave up waiting.
        match call {
            TerminalCall::Snapshot { reply } => {
                let result = bounded(&account_id, call_timeout, client.snapshot()).await;
                let _ = reply.send(result);
            }
            TerminalCall::Open { request, reply } => {
                let result = bounded(&account_id, call_timeout, client.open(&request)).await;
                let _ = reply.send(result);
            }
            TerminalCall::Modify {
                position_id,
                stop_loss,
                take_profit,
                reply,
            } => {
                let result = bounded(
                    &account_id,
                    call_timeout,
                    client.modify(position_id, stop_loss, take_profit),
                )
                .await;
                let _ = reply.send(result);
            }
            TerminalCall::Close { position_id, reply } => {
                let result = bounded(&account_id, call_timeout, client.close(position_id)).await;
                let _ = reply.send(result);
            }
        }
    }

    debug!(account = %account_id, "Terminal worker stopped");
}

async fn bounded<T>(
    account_id: &str,
    limit: Duration,
    call: impl Future<Output = Result<T, TerminalError>>,
) -> Result<T, TerminalError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(account = %account_id, timeout_ms = limit.as_millis() as u64, "Terminal call timed out");
            Err(TerminalError::Timeout(limit))
        }
    }
}
