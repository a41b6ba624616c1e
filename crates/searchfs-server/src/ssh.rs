//! SSH server for searchfs
//!
//! Accepts SSH connections, authenticates the login against every backing
//! instance and serves the SFTP subsystem over the user's searches.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use russh::keys::PrivateKey;
use russh::keys::ssh_key;
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId};
use searchfs_kernel::registry::InstanceSession;
use searchfs_kernel::store::{Repository, StoreResult};
use searchfs_kernel::vfs::{NamespaceLayout, UnixIdentity};
use searchfs_kernel::{PathTranslator, SearchRegistry, TranslatorOptions};
use tokio::net::TcpListener;

use crate::constants::{SFTP_SUBSYSTEM, SSH_AUTH_REJECTION_DELAY};
use crate::sftp::SftpSession;

/// SSH server configuration
#[derive(Clone)]
pub struct SshServerConfig {
    pub bind_addr: SocketAddr,
    pub host_key: PrivateKey,
}

impl SshServerConfig {
    /// Create config with an ephemeral key.
    pub fn ephemeral(bind_addr: SocketAddr) -> Result<Self, russh::keys::Error> {
        let host_key =
            PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)?;
        Ok(Self {
            bind_addr,
            host_key,
        })
    }

    /// Load the host key from an OpenSSH private key file.
    pub fn from_key_file(
        bind_addr: SocketAddr,
        path: &Path,
        passphrase: Option<&str>,
    ) -> Result<Self, russh::keys::Error> {
        let host_key = russh::keys::load_secret_key(path, passphrase)?;
        Ok(Self {
            bind_addr,
            host_key,
        })
    }
}

/// What every connection shares: the backing instances and the namespace
/// framing.
pub struct ServerContext {
    pub repositories: Vec<Arc<dyn Repository>>,
    /// Namespace names, parallel to `repositories`.
    pub instance_names: Vec<String>,
    pub layout: NamespaceLayout,
    pub base_dir: String,
    pub identity: UnixIdentity,
}

impl ServerContext {
    /// Open a session on every instance. Any failure fails the login and
    /// closes the sessions already opened.
    pub async fn authenticate(&self, login: &str, password: &str) -> StoreResult<Vec<InstanceSession>> {
        let mut sessions = Vec::with_capacity(self.repositories.len());
        for (repo, name) in self.repositories.iter().zip(&self.instance_names) {
            match repo.connect(login, password).await {
                Ok(session) => sessions.push(InstanceSession {
                    name: name.clone(),
                    session,
                }),
                Err(e) => {
                    for opened in &sessions {
                        opened.session.close().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(sessions)
    }

    /// A translator over already-authenticated sessions.
    pub fn translator(&self, login: &str, sessions: Vec<InstanceSession>) -> PathTranslator {
        PathTranslator::new(
            Arc::new(SearchRegistry::new(sessions)),
            TranslatorOptions {
                layout: self.layout.clone(),
                base_dir: self.base_dir.clone(),
                identity: self.identity.clone(),
                enforce_access: true,
                refresh_on_list: true,
                login: login.to_owned(),
            },
        )
    }
}

/// SSH server
pub struct SshServer {
    config: SshServerConfig,
    context: Arc<ServerContext>,
}

impl SshServer {
    pub fn new(config: SshServerConfig, context: Arc<ServerContext>) -> Self {
        Self { config, context }
    }

    /// Bind and run the SSH server
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let socket = TcpListener::bind(self.config.bind_addr).await?;
        self.run_on(socket).await
    }

    /// Run on an already bound listener.
    pub async fn run_on(&self, socket: TcpListener) -> Result<(), std::io::Error> {
        let config = russh::server::Config {
            auth_rejection_time: SSH_AUTH_REJECTION_DELAY,
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            keys: vec![self.config.host_key.clone()],
            ..Default::default()
        };

        tracing::info!(addr = ?socket.local_addr().ok(), "Starting SFTP server");

        let mut server = Server {
            context: self.context.clone(),
        };
        server
            .run_on_socket(Arc::new(config), &socket)
            .await
            .map_err(std::io::Error::other)
    }
}

/// Server factory - creates handlers for each connection
struct Server {
    context: Arc<ServerContext>,
}

impl server::Server for Server {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        ConnectionHandler::new(self.context.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        tracing::error!("Session error: {:?}", error);
    }
}

/// Handler for a single SSH connection
struct ConnectionHandler {
    context: Arc<ServerContext>,
    peer: Option<SocketAddr>,
    login: Option<String>,
    /// Sessions opened at login, moved into the translator on `sftp`.
    sessions: Vec<InstanceSession>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    sftp_channel: Option<ChannelId>,
    translator: Option<Arc<PathTranslator>>,
}

impl ConnectionHandler {
    fn new(context: Arc<ServerContext>, peer: Option<SocketAddr>) -> Self {
        Self {
            context,
            peer,
            login: None,
            sessions: Vec::new(),
            channels: HashMap::new(),
            sftp_channel: None,
            translator: None,
        }
    }

    async fn start_sftp(&mut self, channel: Channel<Msg>) {
        let login = self.login.clone().unwrap_or_default();
        let sessions = std::mem::take(&mut self.sessions);
        let translator = Arc::new(self.context.translator(&login, sessions));
        if let Err(e) = translator.refresh().await {
            // Listing the root retries.
            tracing::warn!(login = %login, error = %e, "initial tree build failed");
        }
        self.translator = Some(translator.clone());
        tracing::info!(login = %login, peer = ?self.peer, "SFTP session started");
        russh_sftp::server::run(channel.into_stream(), SftpSession::new(translator)).await;
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        let translator = self.translator.take();
        let sessions = std::mem::take(&mut self.sessions);
        if translator.is_none() && sessions.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Some(translator) = translator {
                translator.close().await;
            }
            for opened in sessions {
                opened.session.close().await;
            }
        });
    }
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if let Some(login) = &self.login {
            tracing::warn!(login = %login, attempted = %user, peer = ?self.peer, "Re-authentication refused");
            return Ok(Auth::reject());
        }
        match self.context.authenticate(user, password).await {
            Ok(sessions) => {
                tracing::info!(login = %user, peer = ?self.peer, "Login accepted");
                self.login = Some(user.to_owned());
                self.sessions = sessions;
                Ok(Auth::Accept)
            }
            Err(e) => {
                tracing::warn!(login = %user, peer = ?self.peer, error = %e, "Login rejected");
                Ok(Auth::reject())
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        tracing::debug!(login = %user, "Public key authentication is not offered");
        Ok(Auth::reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Channel {} opened", channel.id());
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != SFTP_SUBSYSTEM || self.translator.is_some() {
            tracing::warn!(subsystem = name, "Refusing subsystem request");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        match self.channels.remove(&channel_id) {
            Some(channel) => {
                session.channel_success(channel_id)?;
                self.sftp_channel = Some(channel_id);
                self.start_sftp(channel).await;
            }
            None => session.channel_failure(channel_id)?,
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel {} closed", channel);
        self.channels.remove(&channel);
        if self.sftp_channel == Some(channel) {
            if let Some(translator) = self.translator.take() {
                translator.close().await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::server::Handler as _;
    use searchfs_kernel::SqliteRepository;
    use searchfs_kernel::store::StoreSession as _;

    fn context() -> Arc<ServerContext> {
        let repo = SqliteRepository::in_memory().unwrap();
        repo.create_user("alice", "pw").unwrap();
        repo.create_user("bob", "pw").unwrap();
        Arc::new(ServerContext {
            repositories: vec![Arc::new(repo)],
            instance_names: vec!["1_db".into()],
            layout: NamespaceLayout::Single,
            base_dir: "/".into(),
            identity: UnixIdentity::current(),
        })
    }

    #[tokio::test]
    async fn test_bad_password_rejected() {
        let mut handler = ConnectionHandler::new(context(), None);
        let auth = handler.auth_password("alice", "nope").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(handler.login.is_none());
        assert!(handler.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_second_login_refused() {
        let mut handler = ConnectionHandler::new(context(), None);
        let auth = handler.auth_password("alice", "pw").await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(handler.sessions.len(), 1);

        let auth = handler.auth_password("bob", "pw").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert_eq!(handler.login.as_deref(), Some("alice"));
        assert_eq!(handler.sessions.len(), 1);
        assert_eq!(handler.sessions[0].session.login(), "alice");
    }
}
