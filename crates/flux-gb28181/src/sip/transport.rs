// SIP 传输层
// 同一端口同时监听 UDP 与 TCP，入站请求各自一个任务处理，响应交给等待中的客户端事务

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::message::{frame_len, SipMessage, SipRequest, SipResponse};
use super::transaction::{
    retransmit_intervals, ClientTransaction, ResponseSink, SipClient, TransactionTable,
};
use crate::model::Transport;
use crate::{Gb28181Error, Result};

/// 单个 TCP 连接允许缓存的最大未成帧数据
const MAX_TCP_BUFFER: usize = 1024 * 1024;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 入站请求处理
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: SipRequest, sink: Arc<dyn ResponseSink>);
}

struct UdpResponder {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
}

#[async_trait]
impl ResponseSink for UdpResponder {
    async fn respond(&self, res: SipResponse) -> Result<()> {
        tracing::debug!(target: "gb28181::sip", remote = %self.addr, status = res.status_code, "Sending response");
        self.socket.send_to(&res.to_bytes(), self.addr).await?;
        Ok(())
    }
}

struct TcpResponder {
    tx: mpsc::UnboundedSender<Bytes>,
    addr: SocketAddr,
}

#[async_trait]
impl ResponseSink for TcpResponder {
    async fn respond(&self, res: SipResponse) -> Result<()> {
        tracing::debug!(target: "gb28181::sip", remote = %self.addr, status = res.status_code, "Sending response");
        self.tx
            .send(res.to_bytes())
            .map_err(|_| Gb28181Error::SipTransaction(format!("connection to {} closed", self.addr)))
    }
}

/// UDP + TCP 信令传输
pub struct SipTransport {
    me: Weak<SipTransport>,
    local_addr: SocketAddr,
    udp: ArcSwapOption<UdpSocket>,
    listener: Mutex<Option<TcpListener>>,
    tcp_conns: DashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>,
    handler: OnceLock<Arc<dyn RequestHandler>>,
    transactions: Arc<TransactionTable>,
    timeout: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SipTransport {
    /// 绑定 UDP 与 TCP（端口为 0 时 TCP 使用 UDP 分配到的端口）
    pub async fn bind(addr: SocketAddr, timeout: Duration) -> Result<Arc<Self>> {
        let udp = UdpSocket::bind(addr).await?;
        let local_addr = udp.local_addr()?;
        let listener = TcpListener::bind(local_addr).await?;

        tracing::info!(target: "gb28181::sip", addr = %local_addr, "SIP transport bound (UDP/TCP)");

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local_addr,
            udp: ArcSwapOption::from(Some(Arc::new(udp))),
            listener: Mutex::new(Some(listener)),
            tcp_conns: DashMap::new(),
            handler: OnceLock::new(),
            transactions: Arc::new(TransactionTable::new()),
            timeout,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transactions(&self) -> &Arc<TransactionTable> {
        &self.transactions
    }

    /// 启动接收循环
    pub fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        if self.handler.set(handler).is_err() {
            return Err(Gb28181Error::SipTransaction("transport already started".to_string()));
        }
        let me = self.arc()?;

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(socket) = self.udp.load_full() {
            let transport = Arc::clone(&me);
            tasks.push(tokio::spawn(async move { transport.udp_loop(socket).await }));
        }

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener {
            let transport = Arc::clone(&me);
            tasks.push(tokio::spawn(async move { transport.accept_loop(listener).await }));
        }

        Ok(())
    }

    /// 停止接收并释放套接字
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.udp.store(None);
        self.tcp_conns.clear();
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        tracing::info!(target: "gb28181::sip", addr = %self.local_addr, "SIP transport stopped");
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.me
            .upgrade()
            .ok_or_else(|| Gb28181Error::SipTransaction("transport dropped".to_string()))
    }

    async fn udp_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        // ICMP 端口不可达同样会让 recv_from 返回错误
                        tracing::warn!(target: "gb28181::sip", error = %e, "Failed to receive UDP packet");
                        continue;
                    }
                },
            };

            let data = &buf[..len];
            if data.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            let sink: Arc<dyn ResponseSink> = Arc::new(UdpResponder {
                socket: Arc::clone(&socket),
                addr,
            });
            self.on_message(data, addr, Transport::Udp, sink);
        }
        tracing::debug!(target: "gb28181::sip", "UDP loop stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = listener.accept() => match r {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(target: "gb28181::sip", error = %e, "Failed to accept TCP connection");
                        continue;
                    }
                },
            };
            tracing::debug!(target: "gb28181::sip", remote = %peer, "TCP connection accepted");
            self.spawn_connection(stream, peer);
        }
        tracing::debug!(target: "gb28181::sip", "TCP accept loop stopped");
    }

    /// 登记 TCP 连接并启动读写任务，返回写通道
    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> mpsc::UnboundedSender<Bytes> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        self.tcp_conns.insert(peer, tx.clone());

        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    tracing::warn!(target: "gb28181::sip", remote = %peer, error = %e, "TCP write failed");
                    break;
                }
            }
        });

        let transport = Arc::clone(self);
        let conn_tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8192);
            loop {
                let n = tokio::select! {
                    _ = transport.cancel.cancelled() => break,
                    r = reader.read_buf(&mut buf) => match r {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::debug!(target: "gb28181::sip", remote = %peer, error = %e, "TCP read failed");
                            break;
                        }
                    },
                };
                if n == 0 {
                    break;
                }

                let mut closing = false;
                loop {
                    // 跳过保活用的空行
                    let skip = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
                    let _ = buf.split_to(skip);

                    let len = match frame_len(&buf, MAX_TCP_BUFFER) {
                        Ok(Some(len)) => len,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(target: "gb28181::sip", remote = %peer, error = %e, "Invalid TCP framing, closing connection");
                            closing = true;
                            break;
                        }
                    };
                    let frame = buf.split_to(len);
                    let sink: Arc<dyn ResponseSink> = Arc::new(TcpResponder {
                        tx: conn_tx.clone(),
                        addr: peer,
                    });
                    transport.on_message(&frame, peer, Transport::Tcp, sink);
                }

                if closing {
                    break;
                }
                if buf.len() > MAX_TCP_BUFFER {
                    tracing::warn!(target: "gb28181::sip", remote = %peer, "TCP buffer overflow, closing connection");
                    break;
                }
            }

            transport
                .tcp_conns
                .remove_if(&peer, |_, sender| sender.same_channel(&conn_tx));
            tracing::debug!(target: "gb28181::sip", remote = %peer, "TCP connection closed");
        });

        tx
    }

    fn on_message(&self, data: &[u8], addr: SocketAddr, transport: Transport, sink: Arc<dyn ResponseSink>) {
        let message = match SipMessage::parse(data) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    target: "gb28181::sip",
                    remote = %addr,
                    bytes = data.len(),
                    error = %e,
                    "Failed to parse SIP message"
                );
                return;
            }
        };

        match message {
            SipMessage::Request(mut req) => {
                req.remote = Some(addr);
                req.transport = transport;

                let Some(handler) = self.handler.get().cloned() else {
                    return;
                };
                let span = tracing::info_span!(
                    "gb28181.sip.request",
                    method = %req.method,
                    remote = %addr,
                    transport = %transport
                );
                tokio::spawn(async move { handler.handle(req, sink).await }.instrument(span));
            }
            SipMessage::Response(res) => {
                let status = res.status_code;
                if !self.transactions.dispatch(res) {
                    tracing::debug!(target: "gb28181::sip", remote = %addr, status, "Unmatched response dropped");
                }
            }
        }
    }

    async fn send_bytes(&self, data: Bytes, dest: SocketAddr, transport: Transport) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Gb28181Error::Cancelled);
        }

        match transport {
            Transport::Udp => {
                let socket = self
                    .udp
                    .load_full()
                    .ok_or_else(|| Gb28181Error::SipTransaction("UDP transport closed".to_string()))?;
                socket.send_to(&data, dest).await?;
            }
            Transport::Tcp => {
                let existing = self.tcp_conns.get(&dest).map(|tx| tx.value().clone());
                let tx = match existing {
                    Some(tx) if !tx.is_closed() => tx,
                    _ => {
                        let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(dest))
                            .await
                            .map_err(|_| Gb28181Error::SipTimeout(format!("connect {}", dest)))??;
                        tracing::debug!(target: "gb28181::sip", remote = %dest, "TCP connection established");
                        self.arc()?.spawn_connection(stream, dest)
                    }
                };
                tx.send(data)
                    .map_err(|_| Gb28181Error::SipTransaction(format!("connection to {} closed", dest)))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SipClient for SipTransport {
    async fn send_request(&self, req: SipRequest) -> Result<ClientTransaction> {
        let branch = req
            .branch()
            .ok_or_else(|| Gb28181Error::SipTransaction("request without Via branch".to_string()))?
            .to_string();
        let dest = req
            .remote
            .ok_or_else(|| Gb28181Error::SipTransaction("request without destination".to_string()))?;

        let (guard, rx) = self.transactions.register(&branch)?;
        let data = req.to_bytes();

        tracing::debug!(
            target: "gb28181::sip",
            method = %req.method,
            remote = %dest,
            transport = %req.transport,
            branch = %branch,
            "Sending request"
        );
        self.send_bytes(data.clone(), dest, req.transport).await?;

        let retransmit = match (req.transport, self.udp.load_full()) {
            (Transport::Udp, Some(socket)) => {
                let token = self.cancel.child_token();
                let stop = token.clone();
                tokio::spawn(async move {
                    for interval in retransmit_intervals() {
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {}
                        }
                        if socket.send_to(&data, dest).await.is_err() {
                            break;
                        }
                    }
                });
                Some(token)
            }
            _ => None,
        };

        Ok(ClientTransaction::new(branch, guard, rx, self.timeout, retransmit))
    }

    async fn write_request(&self, req: SipRequest) -> Result<()> {
        let dest = req
            .remote
            .ok_or_else(|| Gb28181Error::SipTransaction("request without destination".to_string()))?;
        self.send_bytes(req.to_bytes(), dest, req.transport).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::builder::response_from_request;
    use crate::sip::message::SipMethod;
    use tokio_util::sync::CancellationToken as Token;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, req: SipRequest, sink: Arc<dyn ResponseSink>) {
            let _ = sink.respond(response_from_request(&req, 200, "OK")).await;
        }
    }

    fn request(method: SipMethod, branch: &str, remote: SocketAddr, transport: Transport) -> SipRequest {
        let mut req = SipRequest::new(method, "sip:34020000001320000001@3402000000");
        req.headers.add(
            "Via",
            format!("SIP/2.0/{} 127.0.0.1:5060;branch={}", transport, branch),
        );
        req.headers.add("From", "<sip:34020000002000000001@3402000000>;tag=1");
        req.headers.add("To", "<sip:34020000001320000001@3402000000>");
        req.headers.add("Call-ID", branch);
        req.headers.add("CSeq", "1 MESSAGE");
        req.remote = Some(remote);
        req.transport = transport;
        req
    }

    async fn pair() -> (Arc<SipTransport>, Arc<SipTransport>) {
        let a = SipTransport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        let b = SipTransport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        a.start(Arc::new(Echo)).unwrap();
        b.start(Arc::new(Echo)).unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_udp_request_response() {
        let (a, b) = pair().await;

        let req = request(SipMethod::Message, "z9hG4bKudp1", b.local_addr(), Transport::Udp);
        let mut tx = a.send_request(req).await.unwrap();
        let res = tx.final_response(&Token::new()).await.unwrap();
        assert_eq!(res.status_code, 200);
        assert_eq!(res.call_id(), Some("z9hG4bKudp1"));

        drop(tx);
        assert!(a.transactions().is_empty());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_tcp_request_response() {
        let (a, b) = pair().await;

        let req = request(SipMethod::Message, "z9hG4bKtcp1", b.local_addr(), Transport::Tcp);
        let mut tx = a.send_request(req).await.unwrap();
        let res = tx.final_response(&Token::new()).await.unwrap();
        assert_eq!(res.status_code, 200);

        // 复用已建立的连接
        let req = request(SipMethod::Message, "z9hG4bKtcp2", b.local_addr(), Transport::Tcp);
        let mut tx = a.send_request(req).await.unwrap();
        assert_eq!(tx.final_response(&Token::new()).await.unwrap().status_code, 200);
        assert_eq!(a.tcp_conns.len(), 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_after_shutdown() {
        let (a, b) = pair().await;
        a.shutdown().await;

        let req = request(SipMethod::Message, "z9hG4bKclosed", b.local_addr(), Transport::Udp);
        assert!(a.send_request(req).await.is_err());
        assert!(a.transactions().is_empty());

        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (a, _b) = pair().await;
        assert!(a.start(Arc::new(Echo)).is_err());
    }
}
