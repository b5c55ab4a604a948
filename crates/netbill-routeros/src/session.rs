//! One authenticated RouterOS API connection
//!
//! The connection is opened lazily on the first command and reused until an
//! error occurs. Any failure (connect, login, trap, timeout, IO) drops the
//! connection so the next command starts from a fresh login.

use async_trait::async_trait;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{SecretStore, SessionConfig};
use crate::protocol::{self, Command, Response};
use crate::{Result, RouterApi, RouterError};

/// Opens the byte stream a session talks over
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, address: &str) -> io::Result<Self::Stream>;
}

/// Plain TCP to the API port
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, address: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Session to a single router
pub struct RouterSession<C: Connector = TcpConnector> {
    config: SessionConfig,
    secrets: Arc<dyn SecretStore>,
    connector: Arc<C>,
    command_timeout: Duration,
    state: RwLock<SessionState>,
    /// Held for the whole request/reply exchange; the wire has no request ids
    conn: Mutex<Option<BufReader<C::Stream>>>,
}

impl<C: Connector> RouterSession<C> {
    pub fn new(
        config: SessionConfig,
        secrets: Arc<dyn SecretStore>,
        connector: Arc<C>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            config,
            secrets,
            connector,
            command_timeout,
            state: RwLock::new(SessionState::Disconnected),
            conn: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Run one command, connecting first if needed
    pub async fn execute(&self, command: &Command) -> Result<Response> {
        let mut slot = self.conn.lock().await;

        let result = match slot.take() {
            Some(stream) => Ok(stream),
            None => self.open().await,
        };
        let result = match result {
            Ok(mut stream) => {
                let reply = self.exchange(&mut stream, command).await;
                if reply.is_ok() {
                    *slot = Some(stream);
                }
                reply
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => {
                metrics::counter!("netbill_router_commands_total", "result" => "ok").increment(1);
                debug!(session = %self.config.name, command = %command.path(), "command completed");
            }
            Err(e) => {
                *self.state.write() = SessionState::Disconnected;
                metrics::counter!("netbill_router_commands_total", "result" => "error").increment(1);
                warn!(
                    session = %self.config.name,
                    command = %command.path(),
                    error = %e,
                    "command failed, connection dropped"
                );
            }
        }
        result
    }

    /// Close the connection if one is open
    pub async fn disconnect(&self) {
        let mut slot = self.conn.lock().await;
        if slot.take().is_some() {
            info!(session = %self.config.name, "router session closed");
        }
        *self.state.write() = SessionState::Disconnected;
    }

    async fn exchange(&self, stream: &mut BufReader<C::Stream>, command: &Command) -> Result<Response> {
        tokio::time::timeout(self.command_timeout, roundtrip(stream, command))
            .await
            .map_err(|_| RouterError::Timeout(self.command_timeout))?
    }

    async fn open(&self) -> Result<BufReader<C::Stream>> {
        self.config.validate()?;
        *self.state.write() = SessionState::Connecting;

        let address = self.config.address();
        debug!(session = %self.config.name, address = %address, "connecting to router");

        let stream = tokio::time::timeout(self.command_timeout, self.connector.connect(&address))
            .await
            .map_err(|_| RouterError::Timeout(self.command_timeout))?
            .map_err(|source| RouterError::Connect {
                address: address.clone(),
                source,
            })?;
        let mut stream = BufReader::new(stream);

        let password = self.secrets.reveal(&self.config.credentials.password)?;
        tokio::time::timeout(self.command_timeout, self.login(&mut stream, &password))
            .await
            .map_err(|_| RouterError::Timeout(self.command_timeout))??;

        *self.state.write() = SessionState::Connected;
        info!(session = %self.config.name, address = %address, "router session established");
        Ok(stream)
    }

    async fn login(&self, stream: &mut BufReader<C::Stream>, password: &str) -> Result<()> {
        let user = &self.config.credentials.username;
        let cmd = Command::new("/login")
            .attr("name", user)
            .attr("password", password);
        let response = roundtrip(stream, &cmd).await.map_err(login_error)?;

        // pre-6.43 routers answer with an MD5 challenge
        if let Some(challenge) = response.done.get("ret") {
            debug!(session = %self.config.name, "router requested challenge login");
            let cmd = Command::new("/login")
                .attr("name", user)
                .attr("response", &challenge_response(password, challenge)?);
            roundtrip(stream, &cmd).await.map_err(login_error)?;
        }
        Ok(())
    }
}

async fn roundtrip<S>(stream: &mut S, command: &Command) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    protocol::write_sentence(stream, command.words()).await?;
    protocol::read_response(stream).await
}

fn login_error(e: RouterError) -> RouterError {
    match e {
        RouterError::Trap { message, .. } => RouterError::LoginRejected(message),
        other => other,
    }
}

/// `00` followed by md5(0x00 || password || challenge) in hex
pub(crate) fn challenge_response(password: &str, challenge_hex: &str) -> Result<String> {
    let challenge = hex::decode(challenge_hex)
        .map_err(|e| RouterError::Malformed(format!("bad login challenge: {}", e)))?;
    let mut hasher = Md5::new();
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hasher.update(&challenge);
    Ok(format!("00{}", hex::encode(hasher.finalize())))
}

#[async_trait]
impl<C: Connector> RouterApi for RouterSession<C> {
    async fn set_secret_profile(&self, secret: &str, profile: &str) -> Result<()> {
        let cmd = Command::new("/ppp/secret/set")
            .attr("numbers", secret)
            .attr("profile", profile);
        self.execute(&cmd).await?;
        Ok(())
    }

    async fn remove_active_sessions(&self, secret: &str) -> Result<usize> {
        let print = Command::new("/ppp/active/print")
            .attr(".proplist", ".id")
            .query("name", secret);
        let active = self.execute(&print).await?;

        // an entry can vanish between print and remove; keep going
        let ids: Vec<&String> = active.rows.iter().filter_map(|row| row.get(".id")).collect();
        let mut removed = 0;
        let mut last_error = None;
        for id in &ids {
            match self
                .execute(&Command::new("/ppp/active/remove").attr(".id", id.as_str()))
                .await
            {
                Ok(_) => removed += 1,
                Err(e) => {
                    warn!(session = %self.config.name, secret = %secret, id = %id, error = %e, "active session remove failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if removed == 0 => Err(e),
            _ => Ok(removed),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::credentials::{AeadSecretStore, SessionCredentials};
    use crate::protocol::{read_sentence, write_sentence};
    use netbill_common::{Classify, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;

    const CHALLENGE: &str = "0123456789abcdef0123456789abcdef";

    /// In-process stand-in for a RouterOS API endpoint
    pub(crate) struct FakeRouter {
        pub password: String,
        pub challenge_login: bool,
        pub connects: AtomicUsize,
        pub secret_sets: parking_lot::Mutex<Vec<(String, String)>>,
        pub removed: parking_lot::Mutex<Vec<String>>,
        /// Active ids that trap on remove as if already gone
        pub vanished: parking_lot::Mutex<Vec<String>>,
        pub reply_delay: parking_lot::Mutex<Duration>,
    }

    impl FakeRouter {
        pub fn new(password: &str) -> Arc<Self> {
            Self::build(password, false)
        }

        pub fn with_challenge_login(password: &str) -> Arc<Self> {
            Self::build(password, true)
        }

        fn build(password: &str, challenge_login: bool) -> Arc<Self> {
            Arc::new(Self {
                password: password.into(),
                challenge_login,
                connects: AtomicUsize::new(0),
                secret_sets: parking_lot::Mutex::new(Vec::new()),
                removed: parking_lot::Mutex::new(Vec::new()),
                vanished: parking_lot::Mutex::new(Vec::new()),
                reply_delay: parking_lot::Mutex::new(Duration::ZERO),
            })
        }

        fn attr(words: &[String], key: &str) -> Option<String> {
            let prefix = format!("={}=", key);
            words
                .iter()
                .find_map(|w| w.strip_prefix(&prefix).map(str::to_string))
        }

        async fn serve(self: Arc<Self>, mut wire: DuplexStream) {
            while let Ok(words) = read_sentence(&mut wire).await {
                let Some(path) = words.first().cloned() else { continue };
                let replies: Vec<Vec<String>> = match path.as_str() {
                    "/login" => self.login_reply(&words),
                    "/ppp/secret/set" => match Self::attr(&words, "numbers").as_deref() {
                        Some("ghost") => trap("no such item"),
                        Some(secret) => {
                            let profile = Self::attr(&words, "profile").unwrap_or_default();
                            self.secret_sets.lock().push((secret.to_string(), profile));
                            vec![vec!["!done".into()]]
                        }
                        None => trap("missing numbers"),
                    },
                    "/ppp/active/print" => {
                        if words.iter().any(|w| w == "?name=budi") {
                            vec![
                                vec!["!re".into(), "=.id=*1".into()],
                                vec!["!re".into(), "=.id=*2".into()],
                                vec!["!done".into()],
                            ]
                        } else {
                            vec![vec!["!done".into()]]
                        }
                    }
                    "/ppp/active/remove" => match Self::attr(&words, ".id") {
                        Some(id) if self.vanished.lock().contains(&id) => trap("no such item"),
                        Some(id) => {
                            self.removed.lock().push(id);
                            vec![vec!["!done".into()]]
                        }
                        None => trap("missing .id"),
                    },
                    // never answers
                    "/hang" => continue,
                    _ => trap("no such command"),
                };
                let delay = *self.reply_delay.lock();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                for reply in replies {
                    if write_sentence(&mut wire, &reply).await.is_err() {
                        return;
                    }
                }
            }
        }

        fn login_reply(&self, words: &[String]) -> Vec<Vec<String>> {
            if let Some(response) = Self::attr(words, "response") {
                let expected = challenge_response(&self.password, CHALLENGE).unwrap_or_default();
                return if response == expected {
                    vec![vec!["!done".into()]]
                } else {
                    trap("invalid user name or password (6)")
                };
            }
            if self.challenge_login {
                return vec![vec!["!done".into(), format!("=ret={}", CHALLENGE)]];
            }
            if Self::attr(words, "password").as_deref() == Some(self.password.as_str()) {
                vec![vec!["!done".into()]]
            } else {
                trap("invalid user name or password (6)")
            }
        }
    }

    fn trap(message: &str) -> Vec<Vec<String>> {
        vec![
            vec!["!trap".into(), format!("=message={}", message)],
            vec!["!done".into()],
        ]
    }

    pub(crate) struct DuplexConnector {
        pub router: Arc<FakeRouter>,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _address: &str) -> io::Result<DuplexStream> {
            let (client, server) = tokio::io::duplex(4096);
            self.router.connects.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(self.router.clone().serve(server));
            Ok(client)
        }
    }

    pub(crate) fn sealed_config(store: &AeadSecretStore, name: &str, password: &str) -> SessionConfig {
        SessionConfig {
            name: name.into(),
            host: "192.0.2.1".into(),
            port: crate::API_PORT,
            credentials: SessionCredentials {
                username: "netbill".into(),
                password: store.seal(password).unwrap(),
            },
        }
    }

    fn session_with(router: Arc<FakeRouter>, password: &str, timeout: Duration) -> RouterSession<DuplexConnector> {
        let store = AeadSecretStore::new(&[9u8; 32]).unwrap();
        let config = sealed_config(&store, "core-1", password);
        RouterSession::new(
            config,
            Arc::new(store),
            Arc::new(DuplexConnector { router }),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_connection_reused_across_commands() {
        let router = FakeRouter::new("pw");
        let session = session_with(router.clone(), "pw", Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Disconnected);

        session.set_secret_profile("budi", "isolir").await.unwrap();
        session.set_secret_profile("budi", "10M").await.unwrap();

        assert_eq!(router.connects.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(
            *router.secret_sets.lock(),
            vec![
                ("budi".to_string(), "isolir".to_string()),
                ("budi".to_string(), "10M".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let router = FakeRouter::new("pw");
        let session = session_with(router.clone(), "nope", Duration::from_secs(5));

        let err = session.set_secret_profile("budi", "10M").await.unwrap_err();
        assert!(matches!(err, RouterError::LoginRejected(_)));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(router.secret_sets.lock().is_empty());
    }

    #[tokio::test]
    async fn test_challenge_login() {
        let router = FakeRouter::with_challenge_login("pw");
        let session = session_with(router.clone(), "pw", Duration::from_secs(5));

        session.set_secret_profile("budi", "10M").await.unwrap();
        assert_eq!(router.secret_sets.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_trap_drops_connection() {
        let router = FakeRouter::new("pw");
        let session = session_with(router.clone(), "pw", Duration::from_secs(5));

        let err = session.set_secret_profile("ghost", "10M").await.unwrap_err();
        assert!(matches!(err, RouterError::Trap { ref message, .. } if message == "no such item"));
        assert_eq!(session.state(), SessionState::Disconnected);

        session.set_secret_profile("budi", "10M").await.unwrap();
        assert_eq!(router.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_reconnect() {
        let router = FakeRouter::new("pw");
        let session = session_with(router.clone(), "pw", Duration::from_millis(200));

        let err = session.execute(&Command::new("/hang")).await.unwrap_err();
        assert!(matches!(err, RouterError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert_eq!(session.state(), SessionState::Disconnected);

        session.set_secret_profile("budi", "10M").await.unwrap();
        assert_eq!(router.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_active_sessions() {
        let router = FakeRouter::new("pw");
        let session = session_with(router.clone(), "pw", Duration::from_secs(5));

        assert_eq!(session.remove_active_sessions("budi").await.unwrap(), 2);
        assert_eq!(*router.removed.lock(), vec!["*1".to_string(), "*2".to_string()]);
        assert_eq!(session.remove_active_sessions("siti").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_continues_past_vanished_session() {
        let router = FakeRouter::new("pw");
        router.vanished.lock().push("*1".into());
        let session = session_with(router.clone(), "pw", Duration::from_secs(5));

        assert_eq!(session.remove_active_sessions("budi").await.unwrap(), 1);
        assert_eq!(*router.removed.lock(), vec!["*2".to_string()]);

        router.vanished.lock().push("*2".into());
        router.removed.lock().clear();
        let err = session.remove_active_sessions("budi").await.unwrap_err();
        assert!(matches!(err, RouterError::Trap { ref message, .. } if message == "no such item"));
        assert!(router.removed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_commands_share_one_connection() {
        let router = FakeRouter::new("pw");
        *router.reply_delay.lock() = Duration::from_millis(5);
        let session = Arc::new(session_with(router.clone(), "pw", Duration::from_secs(5)));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let session = session.clone();
                tokio::spawn(async move { session.set_secret_profile("budi", &format!("p{}", i)).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(router.connects.load(Ordering::SeqCst), 1);
        let mut profiles: Vec<String> = router
            .secret_sets
            .lock()
            .iter()
            .map(|(_, profile)| profile.clone())
            .collect();
        profiles.sort();
        assert_eq!(profiles, (0..8).map(|i| format!("p{}", i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_incomplete_credentials_never_dial() {
        let router = FakeRouter::new("pw");
        let store = AeadSecretStore::new(&[9u8; 32]).unwrap();
        let mut config = sealed_config(&store, "core-1", "pw");
        config.host = String::new();
        let session = RouterSession::new(
            config,
            Arc::new(store),
            Arc::new(DuplexConnector { router: router.clone() }),
            Duration::from_secs(5),
        );

        let err = session.set_secret_profile("budi", "10M").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(router.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let router = FakeRouter::new("pw");
        let session = session_with(router.clone(), "pw", Duration::from_secs(5));
        session.set_secret_profile("budi", "10M").await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        session.set_secret_profile("budi", "10M").await.unwrap();
        assert_eq!(router.connects.load(Ordering::SeqCst), 2);
    }
}
