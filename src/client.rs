mod executor;
pub(crate) mod options;
pub(crate) mod session;

use std::sync::Arc;

use bson::Document;

use self::session::{ClientSession, ServerSession, ServerSessionPool, SessionOptions};
use crate::{
    db::Database,
    error::Result,
    operation::ListDatabases,
    options::ClientOptions,
    results::DatabaseSpecification,
    sdam::Topology,
};

/// The handle to a deployment: it maintains the topology model, the per-server
/// connection pools, and the session pool, and dispatches every operation.
///
/// `Client` is cheap to clone; all clones share the same state. Dropping the
/// last clone stops the background monitors.
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(crate) topology: Topology,
    pub(crate) options: ClientOptions,
    pub(crate) session_pool: ServerSessionPool,
}

impl Client {
    /// Creates a new `Client` connected to the deployment specified by the
    /// given connection string.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref())?;
        Self::with_options(options)
    }

    /// Creates a new `Client` from the given options. Must be called from
    /// within an async runtime so that server monitoring can start.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let topology = Topology::new(options.clone())?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                topology,
                options,
                session_pool: ServerSessionPool::new(),
            }),
        })
    }

    /// Gets a handle to the database with the given name.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    /// Gets a handle to the default database specified in the connection
    /// string, if one was given.
    pub fn default_database(&self) -> Option<Database> {
        self.inner
            .options
            .default_database
            .as_deref()
            .map(|name| self.database(name))
    }

    /// Gets information about each database present in the deployment.
    pub async fn list_databases(&self, filter: Option<Document>) -> Result<Vec<DatabaseSpecification>> {
        self.execute_operation(ListDatabases::new(filter, false), None)
            .await
    }

    /// Gets the names of the databases present in the deployment.
    pub async fn list_database_names(&self, filter: Option<Document>) -> Result<Vec<String>> {
        let databases = self
            .execute_operation(ListDatabases::new(filter, true), None)
            .await?;
        Ok(databases.into_iter().map(|spec| spec.name).collect())
    }

    /// Starts a new explicit [`ClientSession`].
    pub async fn start_session(&self, options: Option<SessionOptions>) -> Result<ClientSession> {
        Ok(self.start_session_internal(options, false).await)
    }

    pub(crate) async fn start_session_internal(
        &self,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> ClientSession {
        let timeout = self.inner.topology.logical_session_timeout();
        let server_session = self.inner.session_pool.check_out(timeout).await;
        ClientSession::new(server_session, self.clone(), options, is_implicit)
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let timeout = self.inner.topology.logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }
}
