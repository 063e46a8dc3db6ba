use bson::{doc, oid::ObjectId, Bson, Document};

use crate::{
    concern::WriteConcern,
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    error::Result,
    operation::{check_command_response, Operation, Retryability, WriteResponseBody},
    Namespace,
};

/// Inserts a batch of documents, shipping them as an out-of-line document
/// sequence. `_id` values are generated client-side when absent so the caller
/// can report inserted ids without a reply round-trip.
#[derive(Debug)]
pub(crate) struct Insert {
    ns: Namespace,
    documents: Vec<Document>,
    inserted_ids: Vec<Bson>,
    ordered: bool,
    write_concern: Option<WriteConcern>,
}

impl Insert {
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<Document>,
        ordered: bool,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        let mut documents = documents;
        let inserted_ids = documents
            .iter_mut()
            .map(|doc| {
                doc.entry("_id".to_string())
                    .or_insert_with(|| Bson::ObjectId(ObjectId::new()))
                    .clone()
            })
            .collect();

        Self {
            ns,
            documents,
            inserted_ids,
            ordered,
            write_concern,
        }
    }

    /// The `_id` of each document in this batch, in input order.
    #[allow(unused)]
    pub(crate) fn inserted_ids(&self) -> &[Bson] {
        &self.inserted_ids
    }
}

impl Operation for Insert {
    type O = WriteResponseBody;
    const NAME: &'static str = "insert";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "ordered": self.ordered,
        };
        if let Some(ref write_concern) = self.write_concern {
            if write_concern.is_some() {
                body.insert("writeConcern", write_concern.to_document());
            }
        }

        let mut command = Command::new(Self::NAME, self.ns.db.clone(), body);
        command.add_document_sequence("documents", self.documents.clone());
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        response.body()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;
    use crate::conn::stream_description::StreamDescription;

    #[test]
    fn generates_ids_and_ships_a_document_sequence() {
        let mut op = Insert::new(
            Namespace::new("db", "coll"),
            vec![doc! { "x": 1 }, doc! { "_id": 42, "x": 2 }],
            true,
            None,
        );

        let ids = op.inserted_ids().to_vec();
        assert_eq!(ids.len(), 2);
        assert!(matches!(ids[0], Bson::ObjectId(_)));
        assert_eq!(ids[1], Bson::Int32(42));

        let cmd = op.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(cmd.body.get_str("insert").unwrap(), "coll");
        assert!(cmd.body.get_bool("ordered").unwrap());
        assert_eq!(cmd.document_sequences.len(), 1);
        assert_eq!(cmd.document_sequences[0].identifier, "documents");
        assert_eq!(cmd.document_sequences[0].documents.len(), 2);
        // The generated _id rides along in the shipped documents.
        assert!(cmd.document_sequences[0].documents[0].get("_id").is_some());
    }
}
