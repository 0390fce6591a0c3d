mod auth;
mod session;

use auth::AuthPolicy;
use clap::Parser;
use session::{ClientSession, SessionHandle, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use tether_shared::{msg_type, now_ms, timing, Envelope, SessionCreated};
use tokio::net::TcpListener;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Reference backend for Tether clients (framed TCP)")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Token accepted as a signed-in user (repeatable)
    #[arg(long = "accept-token")]
    accept_tokens: Vec<String>,

    /// Token reported as expired (repeatable)
    #[arg(long = "expired-token")]
    expired_tokens: Vec<String>,

    /// Prefix that marks a token as a guest identity
    #[arg(long, default_value = "guest_")]
    guest_prefix: String,

    /// Seconds of client silence before a session is reaped
    #[arg(long, default_value_t = timing::PONG_TIMEOUT_MS / 1000)]
    idle_timeout: u64,
}

/// Shared server settings handed to every connection task
struct ServerContext {
    policy: AuthPolicy,
    sessions: SessionManager,
    handshake_timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let context = Arc::new(ServerContext {
        policy: AuthPolicy::new(cli.accept_tokens, cli.expired_tokens)
            .with_guest_prefix(cli.guest_prefix),
        sessions: SessionManager::new(),
        handshake_timeout: Duration::from_millis(timing::HANDSHAKE_TIMEOUT_MS),
    });

    let listener = TcpListener::bind(&cli.listen).await?;
    info!("Server listening on {}", cli.listen);

    tokio::spawn(reap_idle_sessions(
        context.sessions.clone(),
        Duration::from_secs(cli.idle_timeout),
    ));

    loop {
        let (socket, addr) = listener.accept().await?;
        debug!(%addr, "Connection accepted");

        let context = context.clone();
        tokio::spawn(async move {
            handle_client(ClientSession::new(socket, addr), &context).await;
        });
    }
}

/// Periodically close sessions whose clients went silent
async fn reap_idle_sessions(sessions: SessionManager, idle_timeout: Duration) {
    let mut ticker = interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        for handle in sessions.remove_dead_sessions(idle_timeout).await {
            let idle_ms = handle.idle_for().await.as_millis() as u64;
            warn!(
                session_id = %handle.session_id,
                idle_ms = idle_ms,
                "Reaping idle session"
            );
            if let Err(e) = handle.close().await {
                debug!("Close failed: {}", e);
            }
        }
    }
}

/// Run one connection: handshake, then serve until the client goes away
async fn handle_client(mut session: ClientSession, context: &ServerContext) {
    let addr = session.addr();

    let token = match timeout(context.handshake_timeout, session.recv()).await {
        Ok(Some(envelope)) if envelope.msg_type == msg_type::AUTH => {
            envelope.auth_token().map(str::to_string)
        }
        Ok(Some(envelope)) => {
            debug!(%addr, msg_type = %envelope.msg_type, "Expected auth frame first");
            None
        }
        Ok(None) => {
            debug!(%addr, "Client left before authenticating");
            return;
        }
        Err(_) => {
            warn!(%addr, "No auth frame within {:?}", context.handshake_timeout);
            return;
        }
    };

    let identity = match context.policy.validate(token.as_deref()) {
        Ok(identity) => identity,
        Err(rejection) => {
            info!(%addr, code = %rejection.code, "Rejecting client");
            let handle = session.get_handle();
            if let Err(e) = handle.send(&Envelope::auth_error(&rejection)).await {
                debug!(%addr, "Could not deliver auth_error: {}", e);
            }
            let _ = handle.close().await;
            return;
        }
    };

    session.handle.session_id = Uuid::new_v4().to_string();
    session.handle.user_id = identity.user_id;
    session.handle.is_guest = identity.is_guest;
    let handle = session.get_handle();

    let confirmation = Envelope::session_created(&SessionCreated {
        session_id: handle.session_id.clone(),
        user_id: handle.user_id.clone(),
        is_guest: handle.is_guest,
        timestamp: Some(now_ms()),
    });
    context.sessions.register(handle.clone()).await;
    if let Err(e) = handle.send(&confirmation).await {
        warn!(%addr, "Could not confirm session: {}", e);
        context.sessions.unregister(&handle.session_id).await;
        return;
    }

    let sessions = context.sessions.count().await;
    info!(
        %addr,
        session_id = %handle.session_id,
        user_id = %handle.user_id,
        is_guest = handle.is_guest,
        sessions = sessions,
        "Session created"
    );

    while let Some(envelope) = session.recv().await {
        if let Err(e) = respond(&handle, envelope).await {
            warn!(session_id = %handle.session_id, "Write failed: {}", e);
            break;
        }
    }

    context.sessions.unregister(&handle.session_id).await;
    info!(
        session_id = %handle.session_id,
        duration_ms = handle.connected_at.elapsed().as_millis() as u64,
        "Session closed"
    );
}

/// Answer probes and echo everything else back within the session
async fn respond(handle: &SessionHandle, envelope: Envelope) -> anyhow::Result<()> {
    match envelope.msg_type.as_str() {
        msg_type::PING => handle.send(&Envelope::pong()).await,
        msg_type::PONG => Ok(()),
        _ => {
            debug!(session_id = %handle.session_id, msg_type = %envelope.msg_type, "Echo");
            let echo = Envelope::new(envelope.msg_type, envelope.data)
                .with_session(handle.session_id.clone());
            handle.send(&echo).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_shared::codec::{self, FrameDecoder};
    use tether_shared::{AuthErrorCode, AuthErrorInfo};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct TestClient {
        stream: TcpStream,
        decoder: FrameDecoder,
    }

    impl TestClient {
        async fn send(&mut self, envelope: &Envelope) {
            let frame = codec::encode(envelope).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Envelope> {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(envelope) = self.decoder.decode_next().unwrap() {
                    return Some(envelope);
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.decoder.extend(&buf[..n]);
            }
        }
    }

    async fn start() -> (Arc<ServerContext>, std::net::SocketAddr) {
        let context = Arc::new(ServerContext {
            policy: AuthPolicy::new(vec!["jwt-ok".into()], vec!["jwt-old".into()]),
            sessions: SessionManager::new(),
            handshake_timeout: Duration::from_secs(10),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ctx = context.clone();
        tokio::spawn(async move {
            loop {
                let (socket, peer) = listener.accept().await.unwrap();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_client(ClientSession::new(socket, peer), &ctx).await;
                });
            }
        });
        (context, addr)
    }

    async fn client(addr: std::net::SocketAddr, token: &str) -> TestClient {
        let mut client = TestClient {
            stream: TcpStream::connect(addr).await.unwrap(),
            decoder: FrameDecoder::new(),
        };
        client.send(&Envelope::auth(token)).await;
        client
    }

    #[tokio::test]
    async fn test_accepted_token_gets_a_session() {
        let (context, addr) = start().await;
        let mut client = client(addr, "jwt-ok").await;

        let confirmation = client.recv().await.unwrap();
        assert_eq!(confirmation.msg_type, "session_created");
        let created: SessionCreated = confirmation.decode_data().unwrap();
        assert_eq!(created.user_id, "user-1");
        assert!(!created.is_guest);
        assert_eq!(context.sessions.count().await, 1);

        client.send(&Envelope::ping()).await;
        assert_eq!(client.recv().await.unwrap().msg_type, "pong");

        client
            .send(&Envelope::new("chat", Some(json!({ "text": "hi" }))))
            .await;
        let echo = client.recv().await.unwrap();
        assert_eq!(echo.msg_type, "chat");
        assert_eq!(echo.session_id, Some(created.session_id));
        assert_eq!(echo.data, Some(json!({ "text": "hi" })));
    }

    #[tokio::test]
    async fn test_guest_token_is_flagged() {
        let (_context, addr) = start().await;
        let mut client = client(addr, "guest_abc").await;

        let created: SessionCreated = client.recv().await.unwrap().decode_data().unwrap();
        assert!(created.is_guest);
    }

    #[tokio::test]
    async fn test_rejections_close_the_connection() {
        let (context, addr) = start().await;

        for (token, code) in [
            ("jwt-old", AuthErrorCode::Expired),
            ("forged", AuthErrorCode::Invalid),
            ("", AuthErrorCode::Required),
        ] {
            let mut client = client(addr, token).await;
            let reply = client.recv().await.unwrap();
            assert_eq!(reply.msg_type, "auth_error");
            let info: AuthErrorInfo = reply.decode_data().unwrap();
            assert_eq!(info.code, code);
            assert!(client.recv().await.is_none());
        }
        assert_eq!(context.sessions.count().await, 0);
    }
}
