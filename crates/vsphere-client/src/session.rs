//! Process-wide vCenter session cache
//!
//! One [`Session`] per `(server, username, datacenter)`. Each session holds a
//! management client, a REST client, the resolved datacenter and a tag cache.
//! The whole map sits behind one mutex so concurrent reconciles never log in
//! twice for the same key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::http::{build_http_client, server_url, CONNECT_TIMEOUT};
use crate::rest::{HttpRestClient, RestClient};
use crate::tags::CachingTagManager;
use crate::types::Datacenter;
use crate::vim::VimClient;
use crate::vim_http::HttpVimClient;

/// Parameters for obtaining a session
#[derive(Clone)]
pub struct SessionParams {
    /// vCenter host name or URL
    pub server: String,
    /// Datacenter to scope lookups to; `None` selects the only datacenter
    pub datacenter: Option<String>,
    /// Login user
    pub username: String,
    /// Login password
    pub password: String,
}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("server", &self.server)
            .field("datacenter", &self.datacenter)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Cache key of a session
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// vCenter server
    pub server: String,
    /// Login user
    pub username: String,
    /// Requested datacenter, empty for the default
    pub datacenter: String,
}

impl From<&SessionParams> for SessionKey {
    fn from(params: &SessionParams) -> Self {
        Self {
            server: params.server.clone(),
            username: params.username.clone(),
            datacenter: params.datacenter.clone().unwrap_or_default(),
        }
    }
}

/// Logged-in vCenter session
pub struct Session {
    /// Cache key
    pub key: SessionKey,
    /// Management API client
    pub vim: Arc<dyn VimClient>,
    /// REST API client
    pub rest: Arc<dyn RestClient>,
    /// Datacenter lookups are scoped to
    pub datacenter: Datacenter,
    /// Tag and category cache
    pub tags: CachingTagManager,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("datacenter", &self.datacenter)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Probe both clients; any probe error counts as inactive
    pub async fn is_active(&self) -> bool {
        let vim = match self.vim.session_is_active().await {
            Ok(active) => active,
            Err(e) => {
                warn!(server = %self.key.server, error = %e, "vCenter session probe failed");
                false
            }
        };
        if !vim {
            return false;
        }
        match self.rest.session_is_active().await {
            Ok(active) => active,
            Err(e) => {
                warn!(server = %self.key.server, error = %e, "vCenter REST session probe failed");
                false
            }
        }
    }

    /// Log out both clients, ignoring failures
    pub async fn logout(&self) {
        if let Err(e) = self.vim.logout().await {
            debug!(server = %self.key.server, error = %e, "vCenter logout failed");
        }
        if let Err(e) = self.rest.logout().await {
            debug!(server = %self.key.server, error = %e, "vCenter REST logout failed");
        }
    }
}

/// Opens the two client connections for a session
#[async_trait]
pub trait Connector: Send + Sync {
    /// Log in to both APIs
    async fn connect(
        &self,
        params: &SessionParams,
    ) -> Result<(Arc<dyn VimClient>, Arc<dyn RestClient>)>;
}

/// Connector for a real vCenter
#[derive(Clone, Debug, Default)]
pub struct VCenterConnector {
    /// Skip certificate verification
    pub insecure: bool,
}

#[async_trait]
impl Connector for VCenterConnector {
    async fn connect(
        &self,
        params: &SessionParams,
    ) -> Result<(Arc<dyn VimClient>, Arc<dyn RestClient>)> {
        let url = server_url(&params.server)?;
        let http = build_http_client(self.insecure)?;
        let vim =
            HttpVimClient::login(http.clone(), &url, &params.username, &params.password).await?;
        let rest = HttpRestClient::login(http, &url, &params.username, &params.password).await?;
        Ok((Arc::new(vim), Arc::new(rest)))
    }
}

/// Session map shared by all reconciles
pub struct SessionCache {
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
}

impl SessionCache {
    /// Create an empty cache
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return a live session for `params`, logging in if needed
    ///
    /// An existing session is reused only if both clients report it active;
    /// otherwise both are logged out and the session is rebuilt.
    pub async fn get_or_create(&self, params: &SessionParams) -> Result<Arc<Session>> {
        let key = SessionKey::from(params);
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&key).cloned() {
            if existing.is_active().await {
                return Ok(existing);
            }
            info!(server = %key.server, username = %key.username, "vCenter session inactive, rebuilding");
            sessions.remove(&key);
            existing.logout().await;
        }

        let session = tokio::time::timeout(CONNECT_TIMEOUT, self.build(key.clone(), params))
            .await
            .map_err(|_| Error::timeout(format!("login to {}", key.server)))??;
        let session = Arc::new(session);
        sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Number of cached sessions
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no session is cached
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn build(&self, key: SessionKey, params: &SessionParams) -> Result<Session> {
        let (vim, rest) = self.connector.connect(params).await?;
        let datacenter = vim.find_datacenter(params.datacenter.as_deref()).await?;
        info!(
            server = %key.server,
            datacenter = %datacenter.name,
            "vCenter session established"
        );
        Ok(Session {
            key,
            tags: CachingTagManager::new(rest.clone()),
            vim,
            rest,
            datacenter,
        })
    }
}
