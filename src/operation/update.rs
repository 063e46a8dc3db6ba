use bson::{doc, Bson, Document};

use crate::{
    concern::WriteConcern,
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    error::{Error, Result},
    operation::{check_command_response, Operation, Retryability, WriteResponseBody},
    Namespace,
};

/// An update statement's modification: either an update document (or
/// aggregation pipeline) or a full replacement document.
#[derive(Clone, Debug)]
pub(crate) enum UpdateOrReplace {
    UpdateModifications(Document),
    Replacement(Document),
}

impl UpdateOrReplace {
    /// Replacement documents must not contain update operators; update
    /// documents must contain nothing else.
    pub(crate) fn validate(&self) -> Result<()> {
        let (doc, expect_operators) = match self {
            Self::UpdateModifications(doc) => (doc, true),
            Self::Replacement(doc) => (doc, false),
        };
        let has_operators = doc.keys().any(|k| k.starts_with('$'));
        if expect_operators && !doc.is_empty() && !has_operators {
            return Err(Error::invalid_argument(
                "update document must only contain update modifiers",
            ));
        }
        if !expect_operators && has_operators {
            return Err(Error::invalid_argument(
                "replacement document must not contain update modifiers",
            ));
        }
        Ok(())
    }

    fn to_bson(&self) -> Bson {
        match self {
            Self::UpdateModifications(doc) | Self::Replacement(doc) => {
                Bson::Document(doc.clone())
            }
        }
    }
}

/// One entry of an `update` command's `updates` sequence.
#[derive(Clone, Debug)]
pub(crate) struct UpdateModel {
    pub(crate) filter: Document,
    pub(crate) update: UpdateOrReplace,
    pub(crate) multi: bool,
    pub(crate) upsert: Option<bool>,
}

impl UpdateModel {
    fn to_document(&self) -> Document {
        let mut doc = doc! {
            "q": self.filter.clone(),
            "u": self.update.to_bson(),
            "multi": self.multi,
        };
        if let Some(upsert) = self.upsert {
            doc.insert("upsert", upsert);
        }
        doc
    }
}

#[derive(Debug)]
pub(crate) struct Update {
    ns: Namespace,
    updates: Vec<UpdateModel>,
    ordered: bool,
    write_concern: Option<WriteConcern>,
}

impl Update {
    pub(crate) fn new(
        ns: Namespace,
        updates: Vec<UpdateModel>,
        ordered: bool,
        write_concern: Option<WriteConcern>,
    ) -> Result<Self> {
        for update in &updates {
            update.update.validate()?;
        }
        Ok(Self {
            ns,
            updates,
            ordered,
            write_concern,
        })
    }
}

impl Operation for Update {
    type O = WriteResponseBody;
    const NAME: &'static str = "update";

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
        command.add_document_sequence(
            "updates",
            self.updates.iter().map(UpdateModel::to_document).collect(),
        );
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
        // Multi-updates can partially apply, so they are never retried.
        if self.updates.iter().any(|update| update.multi) {
            Retryability::None
        } else {
            Retryability::Write
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replacement_documents_must_not_contain_operators() {
        assert!(UpdateOrReplace::Replacement(doc! { "$set": { "x": 1 } })
            .validate()
            .is_err());
        assert!(UpdateOrReplace::Replacement(doc! { "x": 1 }).validate().is_ok());
    }

    #[test]
    fn update_documents_must_contain_only_operators() {
        assert!(UpdateOrReplace::UpdateModifications(doc! { "x": 1 })
            .validate()
            .is_err());
        assert!(
            UpdateOrReplace::UpdateModifications(doc! { "$inc": { "x": 1 } })
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn multi_updates_are_not_retryable() {
        let ns = crate::Namespace::new("db", "coll");
        let single = Update::new(
            ns.clone(),
            vec![UpdateModel {
                filter: doc! {},
                update: UpdateOrReplace::UpdateModifications(doc! { "$set": { "x": 1 } }),
                multi: false,
                upsert: None,
            }],
            true,
            None,
        )
        .unwrap();
        assert_eq!(single.retryability(), Retryability::Write);

        let multi = Update::new(
            ns,
            vec![UpdateModel {
                filter: doc! {},
                update: UpdateOrReplace::UpdateModifications(doc! { "$set": { "x": 1 } }),
                multi: true,
                upsert: None,
            }],
            true,
            None,
        )
        .unwrap();
        assert_eq!(multi.retryability(), Retryability::None);
    }
}
