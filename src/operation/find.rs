use bson::{doc, Document};

use crate::{
    coll::options::{CursorType, FindOptions},
    conn::{command::RawCommandResponse, stream_description::StreamDescription, Command},
    cursor::CursorSpecification,
    error::Result,
    operation::{check_command_response, CursorBody, Operation, Retryability},
    selection_criteria::SelectionCriteria,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: Option<FindOptions>,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options,
        }
    }
}

impl Operation for Find {
    type O = CursorSpecification;
    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "filter": self.filter.clone(),
        };

        if let Some(ref options) = self.options {
            if let Some(ref sort) = options.sort {
                body.insert("sort", sort.clone());
            }
            if let Some(ref projection) = options.projection {
                body.insert("projection", projection.clone());
            }
            if let Some(skip) = options.skip {
                body.insert("skip", skip as i64);
            }
            if let Some(limit) = options.limit {
                // A negative limit means "single batch" in the classic API.
                body.insert("limit", limit.abs());
                if limit < 0 {
                    body.insert("singleBatch", true);
                }
            }
            if let Some(batch_size) = options.batch_size {
                body.insert("batchSize", batch_size as i32);
            }
            if let Some(max_time) = options.max_time {
                body.insert("maxTimeMS", max_time.as_millis() as i64);
            }
            match options.cursor_type {
                Some(CursorType::Tailable) => {
                    body.insert("tailable", true);
                }
                Some(CursorType::TailableAwait) => {
                    body.insert("tailable", true);
                    body.insert("awaitData", true);
                }
                _ => {}
            }
            if let Some(ref read_concern) = options.read_concern {
                body.insert("readConcern", read_concern.to_document());
            }
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        check_command_response(&response)?;
        let body: CursorBody = response.body()?;

        let (batch_size, max_await_time) = self
            .options
            .as_ref()
            .map(|options| {
                let await_time = match options.cursor_type {
                    Some(CursorType::TailableAwait) => options.max_await_time,
                    _ => None,
                };
                (options.batch_size, await_time)
            })
            .unwrap_or((None, None));

        let spec =
            CursorSpecification::new(body.cursor, response.source, batch_size, max_await_time)?;
        Ok(spec.with_limit(self.options.as_ref().and_then(|options| options.limit)))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|options| options.selection_criteria.as_ref())
    }

    fn supports_read_concern(&self) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;
    use crate::coll::options::CursorType;

    #[test]
    fn builds_the_find_command() {
        let options = FindOptions::builder()
            .sort(doc! { "x": 1 })
            .projection(doc! { "_id": 0 })
            .skip(5_u64)
            .limit(10_i64)
            .batch_size(2_u32)
            .build();
        let mut op = Find::new(
            Namespace::new("db", "coll"),
            doc! { "x": { "$gt": 1 } },
            Some(options),
        );
        let cmd = op
            .build(&crate::conn::stream_description::StreamDescription::new_testing())
            .unwrap();

        assert_eq!(cmd.name, "find");
        assert_eq!(cmd.target_db, "db");
        assert_eq!(cmd.body.get_str("find").unwrap(), "coll");
        assert_eq!(cmd.body.get_i64("limit").unwrap(), 10);
        assert_eq!(cmd.body.get_i64("skip").unwrap(), 5);
        assert_eq!(cmd.body.get_i32("batchSize").unwrap(), 2);
        assert!(cmd.body.get("tailable").is_none());
    }

    #[test]
    fn negative_limit_requests_a_single_batch() {
        let options = FindOptions::builder().limit(-3_i64).build();
        let mut op = Find::new(Namespace::new("db", "coll"), doc! {}, Some(options));
        let cmd = op
            .build(&crate::conn::stream_description::StreamDescription::new_testing())
            .unwrap();
        assert_eq!(cmd.body.get_i64("limit").unwrap(), 3);
        assert!(cmd.body.get_bool("singleBatch").unwrap());
    }

    #[test]
    fn await_data_cursors_set_both_flags() {
        let options = FindOptions::builder()
            .cursor_type(CursorType::TailableAwait)
            .build();
        let mut op = Find::new(Namespace::new("db", "coll"), doc! {}, Some(options));
        let cmd = op
            .build(&crate::conn::stream_description::StreamDescription::new_testing())
            .unwrap();
        assert!(cmd.body.get_bool("tailable").unwrap());
        assert!(cmd.body.get_bool("awaitData").unwrap());
    }
}
