use crate::channel::{
    put_string, string_payload, ChannelOpen, ChannelRequest, GlobalRequest, OpenOutcome,
};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelStream, MethodSet, Pty};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capacity of each event stream between handler and orchestrator
const EVENT_BUFFER: usize = 32;

/// `none` authentication callback type
pub type NoneAuthCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Password authentication callback type
pub type PasswordAuthCallback = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Public key authentication callback type
/// Returns true if the given public key is authorized for the user
pub type PubkeyAuthCallback = Arc<dyn Fn(&str, &PublicKey) -> bool + Send + Sync>;

/// Authentication configuration
///
/// With no callback set every client is let in through the `none` method.
#[derive(Clone, Default)]
pub struct AuthConfig {
    pub none_callback: Option<NoneAuthCallback>,
    pub password_callback: Option<PasswordAuthCallback>,
    pub pubkey_callback: Option<PubkeyAuthCallback>,
}

impl AuthConfig {
    pub fn accepts_anyone(&self) -> bool {
        self.none_callback.is_none()
            && self.password_callback.is_none()
            && self.pubkey_callback.is_none()
    }

    /// Methods to advertise to clients
    pub fn methods(&self) -> MethodSet {
        if self.accepts_anyone() {
            return MethodSet::NONE;
        }
        let mut methods = MethodSet::empty();
        if self.none_callback.is_some() {
            methods |= MethodSet::NONE;
        }
        if self.password_callback.is_some() {
            methods |= MethodSet::PASSWORD;
        }
        if self.pubkey_callback.is_some() {
            methods |= MethodSet::PUBLICKEY;
        }
        methods
    }
}

/// Event streams produced by one [`ConnectionHandler`]
pub struct ConnectionEvents {
    pub channels: mpsc::Receiver<ChannelOpen<ChannelStream<Msg>>>,
    pub requests: mpsc::Receiver<GlobalRequest>,
}

/// russh handler for one connection
///
/// Channel opens, channel requests and global requests are turned into
/// events; the handler waits for each answer before returning to russh, so
/// requests on a channel are answered in arrival order.
pub struct ConnectionHandler {
    auth: AuthConfig,
    peer: Option<SocketAddr>,
    channels: mpsc::Sender<ChannelOpen<ChannelStream<Msg>>>,
    globals: mpsc::Sender<GlobalRequest>,
    open: HashMap<ChannelId, mpsc::Sender<ChannelRequest>>,
    next_seq: u64,
}

impl ConnectionHandler {
    pub fn new(auth: AuthConfig, peer: Option<SocketAddr>) -> (Self, ConnectionEvents) {
        let (channels, channels_rx) = mpsc::channel(EVENT_BUFFER);
        let (globals, globals_rx) = mpsc::channel(EVENT_BUFFER);
        let handler = Self {
            auth,
            peer,
            channels,
            globals,
            open: HashMap::new(),
            next_seq: 0,
        };
        let events = ConnectionEvents {
            channels: channels_rx,
            requests: globals_rx,
        };
        (handler, events)
    }

    async fn open_channel(&mut self, kind: &str, channel: Channel<Msg>) -> bool {
        self.next_seq += 1;
        let seq = self.next_seq;
        let id = channel.id();
        debug!(channel = seq, ?id, kind, "Channel open");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (open, outcome) = ChannelOpen::new(seq, kind, channel.into_stream(), rx);
        if self.channels.send(open).await.is_err() {
            return false;
        }

        match outcome.await {
            Ok(OpenOutcome::Accepted) => {
                self.open.insert(id, tx);
                true
            }
            Ok(OpenOutcome::Rejected(reason)) => {
                // russh answers a `false` here with its own reason code
                // (administratively prohibited); `reason` only reaches the log.
                debug!(channel = seq, kind, reason = reason.message(), "Channel refused");
                false
            }
            Err(_) => false,
        }
    }

    /// Forward a request to its channel and answer with the decision
    async fn channel_request(
        &mut self,
        id: ChannelId,
        kind: &str,
        payload: Bytes,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let accepted = match self.open.get(&id).cloned() {
            Some(requests) => {
                let (request, reply) = ChannelRequest::new(kind, payload);
                if requests.send(request).await.is_ok() {
                    reply.await.unwrap_or(false)
                } else {
                    self.open.remove(&id);
                    false
                }
            }
            None => false,
        };

        if accepted {
            session.channel_success(id)?;
        } else {
            session.channel_failure(id)?;
        }
        Ok(())
    }

    async fn global_request(&mut self, kind: &str, payload: Bytes) -> bool {
        let (request, reply) = GlobalRequest::new(kind, payload, true);
        if self.globals.send(request).await.is_err() {
            return false;
        }
        match reply {
            Some(reply) => reply.await.unwrap_or(false),
            None => false,
        }
    }
}

fn forward_payload(address: &str, port: u32) -> Bytes {
    let mut buf = BytesMut::new();
    put_string(&mut buf, address.as_bytes());
    buf.put_u32(port);
    buf.freeze()
}

fn x11_payload(single_connection: bool, protocol: &str, cookie: &str, screen: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(single_connection as u8);
    put_string(&mut buf, protocol.as_bytes());
    put_string(&mut buf, cookie.as_bytes());
    buf.put_u32(screen);
    buf.freeze()
}

#[async_trait]
impl russh::server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        let allowed = match self.auth.none_callback {
            Some(ref callback) => callback(user),
            None => self.auth.accepts_anyone(),
        };

        if allowed {
            info!(user, peer = ?self.peer, "Client accepted without credentials");
            return Ok(Auth::Accept);
        }
        debug!(user, "none authentication refused");
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!(user, "Password authentication attempt");

        if let Some(ref callback) = self.auth.password_callback {
            if callback(user, password) {
                info!(user, "Password authentication successful");
                return Ok(Auth::Accept);
            }
        }

        info!(user, "Password authentication failed");
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(user, key_type = ?public_key.algorithm(), "Public key authentication attempt");

        if let Some(ref callback) = self.auth.pubkey_callback {
            if callback(user, public_key) {
                info!(user, "Public key authentication successful");
                return Ok(Auth::Accept);
            }
        }

        info!(user, "Public key authentication failed");
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel("session", channel).await)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel("x11", channel).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(host = host_to_connect, port = port_to_connect, "direct-tcpip requested");
        Ok(self.open_channel("direct-tcpip", channel).await)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel_id, name, "Subsystem request");
        self.channel_request(
            channel_id,
            "subsystem",
            string_payload(name.as_bytes()),
            session,
        )
        .await
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channel_request(channel_id, "shell", Bytes::new(), session)
            .await
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channel_request(channel_id, "exec", string_payload(data), session)
            .await
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, variable_name.as_bytes());
        put_string(&mut buf, variable_value.as_bytes());
        self.channel_request(channel_id, "env", buf.freeze(), session)
            .await
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, term.as_bytes());
        buf.put_u32(col_width);
        buf.put_u32(row_height);
        buf.put_u32(pix_width);
        buf.put_u32(pix_height);
        // Terminal modes are not forwarded.
        put_string(&mut buf, &[]);
        self.channel_request(channel_id, "pty-req", buf.freeze(), session)
            .await
    }

    async fn x11_request(
        &mut self,
        channel_id: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = x11_payload(
            single_connection,
            x11_auth_protocol,
            x11_auth_cookie,
            x11_screen_number,
        );
        self.channel_request(channel_id, "x11-req", payload, session)
            .await
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel_id, "Channel EOF");
        session.close(channel_id)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel_id, "Channel closed");
        self.open.remove(&channel_id);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .global_request("tcpip-forward", forward_payload(address, *port))
            .await)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .global_request("cancel-tcpip-forward", forward_payload(address, port))
            .await)
    }
}
