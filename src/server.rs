use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::codec::{read_message, write_message, CodecError};
use crate::config::ServerConfig;
use crate::messages::{ErrorCode, ErrorMessage, Message, VerificationStatus};
use crate::networking::bind_listener;
use crate::registry::{FileId, Registry, RegistryError};
use crate::transfer::{TransferError, TransferSession, TransferState};

/// Everything a running server shares between sessions.
///
/// Built once at startup and handed to the accept loop and every
/// connection task.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    sessions: Arc<Semaphore>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, registry: Arc<Registry>) -> Arc<Self> {
        let sessions = Arc::new(Semaphore::new(config.max_sessions));
        Arc::new(ServerContext {
            config,
            registry,
            sessions,
        })
    }

    /// Open the registry named in `config` and build the context.
    pub fn open(config: ServerConfig) -> Result<Arc<Self>, RegistryError> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let registry = Arc::new(Registry::open(&config.database_path)?);
        Ok(Self::new(config, registry))
    }

    pub fn available_sessions(&self) -> usize {
        self.sessions.available_permits()
    }
}

pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl Server {
    pub async fn bind(context: Arc<ServerContext>) -> io::Result<Self> {
        let listener = bind_listener(&context.config.listen_addr()).await?;
        Ok(Server { listener, context })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> io::Result<()> {
        info!("Backup server listening on {}", self.local_addr()?);
        loop {
            let (stream, addr) = self.listener.accept().await?;
            info!("New connection from {}", addr);

            match Arc::clone(&self.context.sessions).try_acquire_owned() {
                Ok(permit) => {
                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        let state = serve_connection(stream, addr, context).await;
                        debug!("Connection {} finished in state {}", addr, state);
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!("Rejecting {}: session limit reached", addr);
                    tokio::spawn(reject_busy(stream));
                }
            }
        }
    }
}

async fn reject_busy(mut stream: TcpStream) {
    let _ = send_error(
        &mut stream,
        ErrorMessage::new(ErrorCode::ServerBusy, "too many concurrent sessions"),
    )
    .await;
}

async fn serve_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ServerContext>,
) -> TransferState {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", addr, e);
    }
    serve_session(&mut stream, context).await
}

/// Run one session to a terminal state over any byte stream.
///
/// The socket is read strictly one message at a time; each read is bounded
/// by the session deadline. Every message is handled on the blocking pool,
/// since handling touches the registry and the stored file. Returns the
/// state the session ended in.
pub async fn serve_session<S>(stream: &mut S, context: Arc<ServerContext>) -> TransferState
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = &context.config;
    let mut session = TransferSession::new(
        Arc::clone(&context.registry),
        config.storage_dir.clone(),
        config.max_chunk_retries,
    );

    loop {
        let message = match next_message(stream, config).await {
            Ok(Some(message)) => message,
            Ok(None) => return abort_session(session, &context, "connection closed by peer").await,
            Err(err) => {
                let _ = send_error(stream, error_message(&err)).await;
                return abort_session(session, &context, &err.to_string()).await;
            }
        };

        let file_id = session.file_id();
        let result = match tokio::task::spawn_blocking(move || {
            let reply = session.handle(message);
            (session, reply)
        })
        .await
        {
            Ok((returned, reply)) => {
                session = returned;
                reply
            }
            Err(e) => {
                error!("Session worker failed: {}", e);
                mark_corrupt(&context.registry, file_id).await;
                let _ = send_error(
                    stream,
                    error_message(&TransferError::Worker(e.to_string())),
                )
                .await;
                return TransferState::Failed;
            }
        };

        match result {
            Ok(reply) => {
                if let Err(e) = send_message(stream, reply).await {
                    let reason = format!("failed to send reply: {}", e);
                    return abort_session(session, &context, &reason).await;
                }
            }
            Err(e) => {
                let _ = send_error(stream, error_message(&e)).await;
                break;
            }
        }

        if session.state().is_terminal() {
            break;
        }
    }

    session.state()
}

/// Next message from the peer; `None` when it closed the connection
/// between messages.
async fn next_message<R>(stream: &mut R, config: &ServerConfig) -> Result<Option<Message>, TransferError>
where
    R: AsyncRead + Unpin,
{
    match timeout(
        config.session_timeout(),
        read_message(stream, config.max_payload_len),
    )
    .await
    {
        Err(_) => Err(TransferError::Timeout),
        Ok(Err(CodecError::TruncatedHeader(0))) => Ok(None),
        Ok(Err(e)) => Err(TransferError::Framing(e)),
        Ok(Ok(frame)) => Message::from_frame(&frame)
            .map(Some)
            .map_err(TransferError::Framing),
    }
}

async fn abort_session(mut session: TransferSession, context: &ServerContext, reason: &str) -> TransferState {
    let file_id = session.file_id();
    let reason = reason.to_string();
    match tokio::task::spawn_blocking(move || {
        session.abort(&reason);
        session.state()
    })
    .await
    {
        Ok(state) => state,
        Err(e) => {
            error!("Abort worker failed: {}", e);
            mark_corrupt(&context.registry, file_id).await;
            TransferState::Failed
        }
    }
}

/// Mark the session's file corrupt when the session itself was lost.
async fn mark_corrupt(registry: &Arc<Registry>, file_id: Option<FileId>) {
    let Some(id) = file_id else {
        return;
    };
    let registry = Arc::clone(registry);
    match tokio::task::spawn_blocking(move || registry.set_verification(id, VerificationStatus::Corrupt)).await {
        Ok(Ok(())) => warn!("File {} marked corrupt after its session was lost", id),
        Ok(Err(e)) => error!("Could not mark file {} corrupt: {}", id, e),
        Err(e) => error!("Could not mark file {} corrupt: {}", id, e),
    }
}

fn error_message(err: &TransferError) -> ErrorMessage {
    ErrorMessage::new(err.error_code(), err.to_string())
}

async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, message: Message) -> Result<(), CodecError> {
    let frame = message.into_frame()?;
    write_message(writer, frame.message_type, &frame.payload).await
}

async fn send_error<W: AsyncWrite + Unpin>(writer: &mut W, error: ErrorMessage) -> Result<(), CodecError> {
    debug!("Sending error {}: {}", error.code, error.message);
    send_message(writer, Message::Error(error)).await
}
