use crate::engine::{SftpEngine, SubsystemEngine};
use crate::error::{Error, Result};
use crate::keys;
use crate::orchestrator::Orchestrator;
use crate::ssh_handler::{AuthConfig, ConnectionHandler};
use russh::keys::{PrivateKey, PublicKey};
use russh::server::Config as SshConfig;
use russh::Disconnect;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Where the host key comes from
#[derive(Clone)]
enum Identity {
    /// `~/.ssh/id_rsa`
    Default,
    File(PathBuf),
    Key(PrivateKey),
}

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Port to bind to
    pub port: u16,
    /// Address to bind to
    pub bind_address: IpAddr,
    identity: Identity,
    /// Authentication rejection time
    pub auth_rejection_time: Duration,
    /// Deadline for the SSH handshake
    pub handshake_timeout: Option<Duration>,
    /// Close connections idle for this long
    pub inactivity_timeout: Option<Duration>,
    /// Keep accepting connections instead of serving a single one
    pub keep_running: bool,
    /// Concurrent connections allowed when `keep_running` is set
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 22,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            identity: Identity::Default,
            auth_rejection_time: Duration::from_secs(3),
            handshake_timeout: None,
            inactivity_timeout: None,
            keep_running: false,
            max_connections: 16,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_key(mut self, key: PrivateKey) -> Self {
        self.identity = Identity::Key(key);
        self
    }

    /// Load the host key from `path` instead of `~/.ssh/id_rsa`
    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity = Identity::File(path.into());
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn keep_running(mut self, keep_running: bool) -> Self {
        self.keep_running = keep_running;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Resolve the configured host key
    pub fn load_identity(&self) -> Result<PrivateKey> {
        match self.identity {
            Identity::Default => keys::load_default_identity(),
            Identity::File(ref path) => keys::load_identity(path),
            Identity::Key(ref key) => Ok(key.clone()),
        }
    }
}

/// SSH server exposing one subsystem engine
pub struct Server<E: SubsystemEngine = SftpEngine> {
    engine: Arc<E>,
    config: ServerConfig,
    auth_config: AuthConfig,
}

impl<E: SubsystemEngine> Clone for Server<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            config: self.config.clone(),
            auth_config: self.auth_config.clone(),
        }
    }
}

impl Default for Server<SftpEngine> {
    /// SFTP over the process working directory
    fn default() -> Self {
        Self::new(SftpEngine::current_dir())
    }
}

impl<E: SubsystemEngine> Server<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
            config: ServerConfig::default(),
            auth_config: AuthConfig::default(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Decide `none` authentication per user
    pub fn with_none_auth<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.auth_config.none_callback = Some(Arc::new(callback));
        self
    }

    /// Set password authentication callback
    pub fn with_password_auth<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.auth_config.password_callback = Some(Arc::new(callback));
        self
    }

    /// Set public key authentication callback
    pub fn with_pubkey_auth<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &PublicKey) -> bool + Send + Sync + 'static,
    {
        self.auth_config.pubkey_callback = Some(Arc::new(callback));
        self
    }

    /// Set static users for password authentication
    pub fn with_users(self, users: Vec<(String, String)>) -> Self {
        let users = Arc::new(users);
        self.with_password_auth(move |user, pass| users.iter().any(|(u, p)| u == user && p == pass))
    }

    fn ssh_config(&self, key: PrivateKey) -> Arc<SshConfig> {
        Arc::new(SshConfig {
            auth_rejection_time: self.config.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: self.config.inactivity_timeout,
            methods: self.auth_config.methods(),
            keys: vec![key],
            ..Default::default()
        })
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.addr();
        TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })
    }

    /// Run the server
    ///
    /// The host key is loaded before the port is bound. Without
    /// `keep_running` exactly one connection is served and its outcome
    /// returned.
    pub async fn run(self) -> Result<()> {
        let key = self.config.load_identity()?;
        let ssh_config = self.ssh_config(key);

        let listener = self.bind().await?;
        info!(addr = %self.config.addr(), "Starting SFTP server");

        if self.config.keep_running {
            self.serve_forever(listener, ssh_config).await
        } else {
            self.serve_once(listener, ssh_config).await
        }
    }

    async fn serve_once(&self, listener: TcpListener, ssh_config: Arc<SshConfig>) -> Result<()> {
        let (stream, peer) = listener.accept().await.map_err(Error::Accept)?;
        drop(listener);

        info!(%peer, "New SSH connection");
        prepare_socket(&stream);
        self.serve_connection(ssh_config, stream, Some(peer)).await
    }

    async fn serve_forever(
        &self,
        listener: TcpListener,
        ssh_config: Arc<SshConfig>,
    ) -> Result<()> {
        let limiter = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            let permit = limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Config("connection limiter closed".to_string()))?;

            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "Failed to accept connection");
                    continue;
                }
            };

            info!(%peer, "New SSH connection");
            prepare_socket(&stream);

            let server = self.clone();
            let ssh_config = ssh_config.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match server.serve_connection(ssh_config, stream, Some(peer)).await {
                    Ok(()) => debug!(%peer, "Connection finished"),
                    Err(err) => warn!(%peer, error = %err, "Connection failed"),
                }
            });
        }
    }

    /// Negotiate SSH over `stream` and multiplex its channels
    pub async fn serve_connection<S>(
        &self,
        ssh_config: Arc<SshConfig>,
        stream: S,
        peer: Option<SocketAddr>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (handler, events) = ConnectionHandler::new(self.auth_config.clone(), peer);

        let negotiate = russh::server::run_stream(ssh_config, stream, handler);
        let session = match self.config.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, negotiate)
                .await
                .map_err(|_| Error::HandshakeTimeout(limit))?,
            None => negotiate.await,
        }
        .map_err(Error::Handshake)?;
        debug!(?peer, "SSH session established");

        let handle = session.handle();
        let orchestrator = Orchestrator::new(self.engine.clone());
        if let Err(err) = orchestrator.run(events.channels, events.requests).await {
            let _ = handle
                .disconnect(Disconnect::ByApplication, err.to_string(), "en".to_string())
                .await;
            return Err(err);
        }

        match session.await {
            Ok(()) => {}
            Err(err) if is_peer_hangup(&err) => debug!(?peer, error = %err, "Peer hung up"),
            Err(err) => return Err(Error::Transport(err)),
        }
        info!(?peer, "Connection closed");
        Ok(())
    }
}

/// A client logging out ends the session with one of these
fn is_peer_hangup(err: &russh::Error) -> bool {
    match err {
        russh::Error::Disconnect => true,
        russh::Error::IO(io) => io.kind() == std::io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}

fn prepare_socket(stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(error = %err, "Failed to set TCP_NODELAY");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::LineEnding;
    use russh::client;
    use russh::{ChannelMsg, MethodSet};
    use std::net::Ipv6Addr;
    use std::path::Path;
    use tokio::task::JoinHandle;

    struct TestClient;

    #[async_trait::async_trait]
    impl client::Handler for TestClient {
        type Error = russh::Error;

        async fn check_server_key(
            &mut self,
            _server_public_key: &PublicKey,
        ) -> std::result::Result<bool, Self::Error> {
            Ok(true)
        }
    }

    /// Serve one connection over an in-memory pipe and log a client into it
    async fn connect(dir: &Path) -> (client::Handle<TestClient>, JoinHandle<Result<()>>) {
        let key = PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519).unwrap();
        let server = Server::new(SftpEngine::new(dir))
            .config(ServerConfig::new().with_key(key.clone()));
        let ssh_config = server.ssh_config(key);

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let served =
            tokio::spawn(async move { server.serve_connection(ssh_config, server_io, None).await });

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, client_io, TestClient)
            .await
            .unwrap();
        assert!(handle.authenticate_none("tester").await.unwrap());
        (handle, served)
    }

    async fn next_msg(channel: &mut russh::Channel<client::Msg>) -> ChannelMsg {
        tokio::time::timeout(Duration::from_secs(5), channel.wait())
            .await
            .expect("no message from server")
            .expect("channel closed")
    }

    /// Wait for the answer to a request sent with `want_reply`
    async fn next_reply(channel: &mut russh::Channel<client::Msg>) -> bool {
        loop {
            match next_msg(channel).await {
                ChannelMsg::Success => return true,
                ChannelMsg::Failure => return false,
                _ => {}
            }
        }
    }

    async fn finish(served: JoinHandle<Result<()>>) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), served)
            .await
            .expect("connection did not finish")
            .unwrap()
    }

    fn write_key(dir: &std::path::Path) -> PathBuf {
        let key = PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519).unwrap();
        let path = dir.join("id_rsa");
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::new();
        assert_eq!(config.addr(), "0.0.0.0:22".parse().unwrap());
        assert!(!config.keep_running);
        assert!(config.handshake_timeout.is_none());
        assert!(matches!(config.identity, Identity::Default));
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new()
            .port(2022)
            .bind_address(IpAddr::V6(Ipv6Addr::LOCALHOST))
            .keep_running(true)
            .max_connections(0)
            .handshake_timeout(Duration::from_secs(10));

        assert_eq!(config.addr(), "[::1]:2022".parse().unwrap());
        assert!(config.keep_running);
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_auth_methods_follow_callbacks() {
        let server = Server::new(SftpEngine::new("/"));
        assert_eq!(server.auth_config.methods(), MethodSet::NONE);

        let server = server.with_users(vec![("user".into(), "pass".into())]);
        assert_eq!(server.auth_config.methods(), MethodSet::PASSWORD);
        let check = server.auth_config.password_callback.as_ref().unwrap();
        assert!(check("user", "pass"));
        assert!(!check("user", "wrong"));
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_bind() {
        let dir = tempfile::tempdir().unwrap();
        // Holding the port means a bind attempt would fail with a different error.
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = busy.local_addr().unwrap().port();

        let config = ServerConfig::new()
            .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(port)
            .with_key_file(dir.path().join("id_rsa"));

        let err = Server::new(SftpEngine::new(dir.path()))
            .config(config)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyLoad { .. }), "got {err}");
    }

    #[tokio::test]
    async fn test_port_in_use_is_bind_error() {
        let dir = tempfile::tempdir().unwrap();
        let key = write_key(dir.path());
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = busy.local_addr().unwrap().port();

        let config = ServerConfig::new()
            .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(port)
            .with_key_file(key);

        let err = Server::new(SftpEngine::new(dir.path()))
            .config(config)
            .run()
            .await
            .unwrap_err();
        match err {
            Error::Bind { addr, .. } => assert_eq!(addr.port(), port),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_sftp_client_logout_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let (client, served) = connect(dir.path()).await;

        let mut channel = client.channel_open_session().await.unwrap();
        channel.request_subsystem(true, "sftp").await.unwrap();
        assert!(next_reply(&mut channel).await);

        // SSH_FXP_INIT, version 3
        channel
            .data(&[0u8, 0, 0, 5, 1, 0, 0, 0, 3][..])
            .await
            .unwrap();
        let version = loop {
            if let ChannelMsg::Data { data } = next_msg(&mut channel).await {
                break data.to_vec();
            }
        };
        assert_eq!(version[4], 2);

        channel.eof().await.unwrap();
        drop(channel);
        drop(client);

        let result = finish(served).await;
        assert!(result.is_ok(), "unexpected result: {result:?}");
    }

    #[tokio::test]
    async fn test_unknown_subsystem_denied_then_sftp_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (client, served) = connect(dir.path()).await;

        let mut channel = client.channel_open_session().await.unwrap();
        channel.request_subsystem(true, "shell").await.unwrap();
        assert!(!next_reply(&mut channel).await);
        channel.request_subsystem(true, "sftp").await.unwrap();
        assert!(next_reply(&mut channel).await);
        // Bridged channels deny everything else.
        channel.request_subsystem(true, "sftp").await.unwrap();
        assert!(!next_reply(&mut channel).await);

        drop(channel);
        drop(client);
        assert!(finish(served).await.is_ok());
    }

    #[tokio::test]
    async fn test_x11_request_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let (client, served) = connect(dir.path()).await;

        let mut channel = client.channel_open_session().await.unwrap();
        channel
            .request_x11(true, false, "MIT-MAGIC-COOKIE-1", "abcd", 0)
            .await
            .unwrap();
        assert!(!next_reply(&mut channel).await);
        channel.request_shell(true).await.unwrap();
        assert!(!next_reply(&mut channel).await);

        drop(channel);
        drop(client);
        assert!(finish(served).await.is_ok());
    }

    #[tokio::test]
    async fn test_direct_tcpip_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (client, served) = connect(dir.path()).await;

        let refused = client
            .channel_open_direct_tcpip("localhost", 80, "127.0.0.1", 4000)
            .await;
        assert!(refused.is_err());

        let mut channel = client.channel_open_session().await.unwrap();
        channel.request_subsystem(true, "sftp").await.unwrap();
        assert!(next_reply(&mut channel).await);

        drop(channel);
        drop(client);
        assert!(finish(served).await.is_ok());
    }

    #[test]
    fn test_peer_hangup_is_not_a_transport_failure() {
        assert!(is_peer_hangup(&russh::Error::Disconnect));
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "early eof");
        assert!(is_peer_hangup(&russh::Error::IO(eof)));
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(!is_peer_hangup(&russh::Error::IO(reset)));
    }

    #[test]
    fn test_explicit_key_is_used() {
        let key = PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519).unwrap();
        let config = ServerConfig::new().with_key(key.clone());
        let loaded = config.load_identity().unwrap();
        assert_eq!(loaded.public_key(), key.public_key());
    }
}
