use bson::Document;
use futures_util::stream::TryStreamExt;

use crate::{
    client::Client,
    coll::Collection,
    cursor::Cursor,
    error::Result,
    operation::{ListCollections, RunCommand},
    selection_criteria::SelectionCriteria,
    Namespace,
};

/// A handle to a database in the deployment. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    /// The name of this database.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The client this database was created from.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Gets a handle to the collection with the given name, deserializing its
    /// documents to [`bson::Document`].
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.client.clone(), Namespace::new(self.name.clone(), name))
    }

    /// Gets a handle to the collection with the given name, deserializing its
    /// documents to `T`.
    pub fn collection_with_type<T>(&self, name: &str) -> Collection<T> {
        Collection::new(self.client.clone(), Namespace::new(self.name.clone(), name))
    }

    /// Runs a command document against this database, verbatim.
    ///
    /// The dispatcher injects `$db`, session and cluster-time fields, but no
    /// retry policy is applied: it cannot know whether an arbitrary command is
    /// safe to re-send.
    pub async fn run_command(
        &self,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let op = RunCommand::new(self.name.clone(), command, selection_criteria.into())?;
        self.client.execute_operation(op, None).await
    }

    /// Lists the specifications of the collections in this database.
    pub async fn list_collections(&self, filter: Option<Document>) -> Result<Cursor<Document>> {
        let op = ListCollections::new(self.name.clone(), filter, false);
        self.client.execute_cursor_operation(op).await
    }

    /// Lists the names of the collections in this database.
    pub async fn list_collection_names(&self, filter: Option<Document>) -> Result<Vec<String>> {
        let op = ListCollections::new(self.name.clone(), filter, true);
        let mut cursor: Cursor<Document> = self.client.execute_cursor_operation(op).await?;
        let mut names = Vec::new();
        while let Some(spec) = cursor.try_next().await? {
            if let Ok(name) = spec.get_str("name") {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}
