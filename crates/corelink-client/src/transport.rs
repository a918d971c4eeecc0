//! RPC transport: one TCP connection to one remote agent, strict
//! lock-step request/reply exchange, and the authentication handshake.
//!
//! The worker engine talks to the agent exclusively through the
//! [`Transport`] trait, so tests can substitute a scripted
//! implementation without touching sockets.

use async_trait::async_trait;
use corelink_proto::codec::{self, DOCUMENT_TERMINATOR};
use corelink_proto::{
    CcState, CcStatus, HostInfo, MessageRecord, ProjectOp, ProjectRecord, RemoteEndpoint,
    ResultInfo, RunMode, TaskOp, TransferOp, TransferRecord, VersionInfo,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::options::ClientOptions;

/// Lock-step document exchange over any byte stream. Each document is
/// terminated by a single 0x03 byte in both directions.
pub struct RpcStream<S> {
    stream: S,
    buf: Vec<u8>,
    max_reply_size: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RpcStream<S> {
    pub fn new(stream: S, max_reply_size: usize) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            max_reply_size,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// One request/reply round trip.
    pub async fn exchange(&mut self, body: &str) -> Result<String> {
        self.send(body).await?;
        self.read_reply().await
    }

    /// Sends a request without waiting for a reply. Used for `quit`,
    /// where the agent may close the socket instead of answering.
    pub async fn send(&mut self, body: &str) -> Result<()> {
        let doc = codec::render_request(body);
        self.stream
            .write_all(doc.as_bytes())
            .await
            .map_err(|err| ClientError::ConnectionDropped(err.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|err| ClientError::ConnectionDropped(err.to_string()))?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == DOCUMENT_TERMINATOR) {
                let mut doc: Vec<u8> = self.buf.drain(..=pos).collect();
                doc.pop();
                // Some agents pad documents with NUL bytes.
                doc.retain(|&b| b != 0);
                return Ok(String::from_utf8_lossy(&doc).into_owned());
            }
            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|err| ClientError::ConnectionDropped(err.to_string()))?;
            if n == 0 {
                return Err(ClientError::ConnectionDropped(
                    "connection closed by agent".into(),
                ));
            }
            if self.buf.len() + n > self.max_reply_size {
                return Err(ClientError::ConnectionDropped(format!(
                    "reply exceeds maximum size of {} bytes",
                    self.max_reply_size
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// One round trip per operation against the remote agent. Object-safe
/// so the worker can hold it boxed and tests can script it.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the connection, or fails with
    /// [`ClientError::ConnectFailed`].
    async fn open(&mut self, endpoint: &RemoteEndpoint) -> Result<()>;

    /// Three-step challenge-response: request a nonce, submit
    /// md5(nonce + password), interpret the verdict.
    async fn authorize(&mut self, password: &str) -> Result<()>;

    /// Best-effort version negotiation. Older agents do not support
    /// the call; they yield `Ok(None)` and the caller falls back to
    /// extracting version information from a full state fetch.
    async fn exchange_versions(&mut self) -> Result<Option<VersionInfo>>;

    async fn get_state(&mut self) -> Result<CcState>;
    async fn get_cc_status(&mut self) -> Result<CcStatus>;
    async fn get_host_info(&mut self) -> Result<HostInfo>;
    async fn get_project_status(&mut self) -> Result<Vec<ProjectRecord>>;
    async fn get_results(&mut self) -> Result<Vec<ResultInfo>>;
    async fn get_file_transfers(&mut self) -> Result<Vec<TransferRecord>>;
    async fn get_message_count(&mut self) -> Result<i32>;
    async fn get_messages(&mut self, since_seq: i32) -> Result<Vec<MessageRecord>>;

    async fn set_run_mode(&mut self, mode: RunMode, duration: f64) -> Result<()>;
    async fn set_network_mode(&mut self, mode: RunMode, duration: f64) -> Result<()>;
    async fn set_gpu_mode(&mut self, mode: RunMode, duration: f64) -> Result<()>;
    async fn run_benchmarks(&mut self) -> Result<()>;
    async fn network_available(&mut self) -> Result<()>;

    /// Asks the agent to exit. Send-only: the agent may close the
    /// socket instead of replying.
    async fn quit(&mut self) -> Result<()>;

    async fn project_op(&mut self, op: ProjectOp, url: &str) -> Result<()>;
    async fn result_op(&mut self, op: TaskOp, url: &str, name: &str) -> Result<()>;
    async fn transfer_op(&mut self, op: TransferOp, url: &str, name: &str) -> Result<()>;

    /// Non-blocking liveness probe, usable after `quit` to detect
    /// whether the peer has closed the socket.
    async fn connection_alive(&mut self) -> bool;

    async fn close(&mut self);
}

/// Creates one fresh transport per connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport + Send>;
}

/// Production transport over a TCP socket.
pub struct TcpTransport {
    options: ClientOptions,
    stream: Option<RpcStream<TcpStream>>,
}

impl TcpTransport {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut RpcStream<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| ClientError::ConnectionDropped("transport not open".into()))
    }

    async fn exchange(&mut self, body: &str) -> Result<String> {
        self.stream()?.exchange(body).await
    }

    async fn ack_op(&mut self, body: &str, entity: &'static str) -> Result<()> {
        let reply = self.exchange(body).await?;
        Ok(codec::parse_ack(&reply, entity)?)
    }

    async fn set_mode(
        &mut self,
        request: &'static str,
        mode: RunMode,
        duration: f64,
    ) -> Result<()> {
        let body = format!(
            "<{request}>\n<{tag}/>\n<duration>{duration}</duration>\n</{request}>",
            tag = mode.xml_tag()
        );
        self.ack_op(&body, request).await
    }
}

/// Factory handing out [`TcpTransport`] instances.
pub struct TcpTransportFactory {
    options: ClientOptions,
}

impl TcpTransportFactory {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self) -> Box<dyn Transport + Send> {
        Box::new(TcpTransport::new(self.options.clone()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self, endpoint: &RemoteEndpoint) -> Result<()> {
        let connect = TcpStream::connect((endpoint.address.as_str(), endpoint.port));
        let stream = match timeout(self.options.connect_timeout, connect).await {
            Err(_) => return Err(ClientError::ConnectFailed("connect timed out".into())),
            Ok(Err(err)) => return Err(ClientError::ConnectFailed(err.to_string())),
            Ok(Ok(stream)) => stream,
        };
        debug!(endpoint = %endpoint.id(), "socket opened");
        self.stream = Some(RpcStream::new(stream, self.options.max_reply_size));
        Ok(())
    }

    async fn authorize(&mut self, password: &str) -> Result<()> {
        let reply = self.exchange("<auth1/>").await?;
        let nonce = codec::parse_auth_nonce(&reply)?;
        let digest = md5::compute(format!("{nonce}{password}"));
        let body = format!("<auth2>\n<nonce_hash>{digest:x}</nonce_hash>\n</auth2>");
        let reply = self.exchange(&body).await?;
        if codec::parse_auth_reply(&reply)? {
            Ok(())
        } else {
            Err(ClientError::AuthRejected)
        }
    }

    async fn exchange_versions(&mut self) -> Result<Option<VersionInfo>> {
        let reply = self.exchange("<exchange_versions/>").await?;
        Ok(codec::parse_version(&reply)?)
    }

    async fn get_state(&mut self) -> Result<CcState> {
        let reply = self.exchange("<get_state/>").await?;
        Ok(codec::parse_state(&reply)?)
    }

    async fn get_cc_status(&mut self) -> Result<CcStatus> {
        let reply = self.exchange("<get_cc_status/>").await?;
        Ok(codec::parse_cc_status(&reply)?)
    }

    async fn get_host_info(&mut self) -> Result<HostInfo> {
        let reply = self.exchange("<get_host_info/>").await?;
        Ok(codec::parse_host_info(&reply)?)
    }

    async fn get_project_status(&mut self) -> Result<Vec<ProjectRecord>> {
        let reply = self.exchange("<get_project_status/>").await?;
        Ok(codec::parse_projects(&reply)?)
    }

    async fn get_results(&mut self) -> Result<Vec<ResultInfo>> {
        let reply = self.exchange("<get_results/>").await?;
        Ok(codec::parse_results(&reply)?)
    }

    async fn get_file_transfers(&mut self) -> Result<Vec<TransferRecord>> {
        let reply = self.exchange("<get_file_transfers/>").await?;
        Ok(codec::parse_transfers(&reply)?)
    }

    async fn get_message_count(&mut self) -> Result<i32> {
        let reply = self.exchange("<get_message_count/>").await?;
        Ok(codec::parse_message_count(&reply)?)
    }

    async fn get_messages(&mut self, since_seq: i32) -> Result<Vec<MessageRecord>> {
        let body = format!("<get_messages>\n<seqno>{since_seq}</seqno>\n</get_messages>");
        let reply = self.exchange(&body).await?;
        Ok(codec::parse_messages(&reply)?)
    }

    async fn set_run_mode(&mut self, mode: RunMode, duration: f64) -> Result<()> {
        self.set_mode("set_run_mode", mode, duration).await
    }

    async fn set_network_mode(&mut self, mode: RunMode, duration: f64) -> Result<()> {
        self.set_mode("set_network_mode", mode, duration).await
    }

    async fn set_gpu_mode(&mut self, mode: RunMode, duration: f64) -> Result<()> {
        self.set_mode("set_gpu_mode", mode, duration).await
    }

    async fn run_benchmarks(&mut self) -> Result<()> {
        self.ack_op("<run_benchmarks/>", "run_benchmarks").await
    }

    async fn network_available(&mut self) -> Result<()> {
        self.ack_op("<network_available/>", "network_available")
            .await
    }

    async fn quit(&mut self) -> Result<()> {
        self.stream()?.send("<quit/>").await
    }

    async fn project_op(&mut self, op: ProjectOp, url: &str) -> Result<()> {
        let tag = op.rpc_tag();
        let body = format!(
            "<{tag}>\n<project_url>{url}</project_url>\n</{tag}>",
            url = codec::escape_text(url)
        );
        self.ack_op(&body, tag).await
    }

    async fn result_op(&mut self, op: TaskOp, url: &str, name: &str) -> Result<()> {
        let tag = op.rpc_tag();
        let body = format!(
            "<{tag}>\n<project_url>{url}</project_url>\n<name>{name}</name>\n</{tag}>",
            url = codec::escape_text(url),
            name = codec::escape_text(name)
        );
        self.ack_op(&body, tag).await
    }

    async fn transfer_op(&mut self, op: TransferOp, url: &str, name: &str) -> Result<()> {
        let tag = op.rpc_tag();
        let body = format!(
            "<{tag}>\n<project_url>{url}</project_url>\n<filename>{name}</filename>\n</{tag}>",
            url = codec::escape_text(url),
            name = codec::escape_text(name)
        );
        self.ack_op(&body, tag).await
    }

    async fn connection_alive(&mut self) -> bool {
        let Some(stream) = &self.stream else {
            return false;
        };
        let mut probe = [0u8; 1];
        match stream.get_ref().try_read(&mut probe) {
            // Orderly close by the peer.
            Ok(0) => false,
            // Unconsumed data; only expected after quit, harmless.
            Ok(_) => true,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}
