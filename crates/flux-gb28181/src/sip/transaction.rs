// SIP 事务
// 客户端事务按 Via branch 匹配响应，离开作用域时自动注销

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::message::{SipRequest, SipResponse};
use crate::{Gb28181Error, Result};

/// RFC 3261 T1
pub const T1: Duration = Duration::from_millis(500);

/// RFC 3261 T2
pub const T2: Duration = Duration::from_secs(4);

/// 默认事务超时 64*T1
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(32);

/// 出站请求能力
#[async_trait]
pub trait SipClient: Send + Sync {
    /// 发送请求并返回事务，响应通过事务获取
    async fn send_request(&self, req: SipRequest) -> Result<ClientTransaction>;

    /// 发送不需要响应的请求（ACK）
    async fn write_request(&self, req: SipRequest) -> Result<()>;
}

/// 入站请求的响应出口
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn respond(&self, res: SipResponse) -> Result<()>;
}

/// 等待中的客户端事务表
#[derive(Default)]
pub struct TransactionTable {
    pending: DashMap<String, mpsc::UnboundedSender<SipResponse>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记事务，返回的守卫在释放时注销
    pub fn register(
        self: &Arc<Self>,
        branch: &str,
    ) -> Result<(TransactionGuard, mpsc::UnboundedReceiver<SipResponse>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.pending.entry(branch.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Gb28181Error::SipTransaction(format!(
                    "duplicate transaction branch: {}",
                    branch
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }

        Ok((
            TransactionGuard {
                table: Arc::clone(self),
                branch: branch.to_string(),
            },
            rx,
        ))
    }

    /// 把响应交给对应事务，没有匹配时返回 false
    pub fn dispatch(&self, res: SipResponse) -> bool {
        let Some(branch) = res.branch().map(str::to_string) else {
            return false;
        };
        match self.pending.get(&branch) {
            Some(tx) => tx.send(res).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// 事务注销守卫
pub struct TransactionGuard {
    table: Arc<TransactionTable>,
    branch: String,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.table.pending.remove(&self.branch);
    }
}

/// 客户端事务
pub struct ClientTransaction {
    branch: String,
    rx: mpsc::UnboundedReceiver<SipResponse>,
    deadline: Instant,
    retransmit: Option<CancellationToken>,
    _retransmit_guard: Option<DropGuard>,
    _guard: Option<TransactionGuard>,
}

impl ClientTransaction {
    pub(crate) fn new(
        branch: String,
        guard: TransactionGuard,
        rx: mpsc::UnboundedReceiver<SipResponse>,
        timeout: Duration,
        retransmit: Option<CancellationToken>,
    ) -> Self {
        let retransmit_guard = retransmit.clone().map(|t| t.drop_guard());
        Self {
            branch,
            rx,
            deadline: Instant::now() + timeout,
            retransmit,
            _retransmit_guard: retransmit_guard,
            _guard: Some(guard),
        }
    }

    /// 不经过事务表的事务，响应直接写入 rx
    pub fn detached(branch: &str, rx: mpsc::UnboundedReceiver<SipResponse>, timeout: Duration) -> Self {
        Self {
            branch: branch.to_string(),
            rx,
            deadline: Instant::now() + timeout,
            retransmit: None,
            _retransmit_guard: None,
            _guard: None,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// 下一个响应（含临时响应），超时返回 SipTimeout
    pub async fn recv(&mut self) -> Result<SipResponse> {
        match tokio::time::timeout_at(self.deadline, self.rx.recv()).await {
            Ok(Some(res)) => {
                if let Some(token) = self.retransmit.take() {
                    token.cancel();
                }
                Ok(res)
            }
            Ok(None) => Err(Gb28181Error::SipTransaction(format!(
                "transaction {} closed",
                self.branch
            ))),
            Err(_) => Err(Gb28181Error::SipTimeout(self.branch.clone())),
        }
    }

    /// 等待最终响应，跳过 1xx
    pub async fn final_response(&mut self, cancel: &CancellationToken) -> Result<SipResponse> {
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(Gb28181Error::Cancelled),
                res = self.recv() => res?,
            };
            if res.is_provisional() {
                tracing::debug!(
                    target: "gb28181::sip",
                    branch = %self.branch,
                    status = res.status_code,
                    "Provisional response"
                );
                continue;
            }
            return Ok(res);
        }
    }
}

/// UDP 重传间隔：T1 起步翻倍，最大 T2
pub fn retransmit_intervals() -> impl Iterator<Item = Duration> {
    std::iter::successors(Some(T1), |d| Some((*d * 2).min(T2)))
}
