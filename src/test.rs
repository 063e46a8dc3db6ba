//! In-process integration tests: a mock server speaking the wire protocol
//! backs scenario tests for dispatch, retry, sessions, cursors and change
//! streams.

mod mock_server;

use bson::{doc, Bson, Document, Timestamp};
use futures::StreamExt;
use futures_util::stream::TryStreamExt;
use tokio::sync::oneshot;

use crate::{
    error::ErrorKind,
    options::{ClientOptions, WriteConcern},
    Client,
};

use mock_server::MockServer;

async fn client_for(server: &MockServer) -> Client {
    let options = ClientOptions::parse(server.uri()).unwrap();
    Client::with_options(options).unwrap()
}

#[tokio::test]
async fn dispatches_a_simple_insert() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let result = coll.insert_one(doc! { "x": 1 }, None).await.unwrap();
    assert_ne!(result.inserted_id, Bson::Null);

    let inserts = server.received_with_name("insert");
    assert_eq!(inserts.len(), 1);
    let body = &inserts[0];
    assert_eq!(body.get_str("$db").unwrap(), "db");
    assert_eq!(body.get_str("insert").unwrap(), "coll");
    // An acknowledged, session-supporting command carries an implicit lsid.
    assert!(body.get_document("lsid").is_ok());
    let documents = body.get_array("documents").unwrap();
    assert_eq!(documents.len(), 1);
}

#[tokio::test]
async fn unacknowledged_writes_carry_no_session_or_txn_number() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let options = crate::options::InsertOneOptions::builder()
        .write_concern(WriteConcern {
            w: Some(crate::options::Acknowledgment::Nodes(0)),
            ..Default::default()
        })
        .build();
    coll.insert_one(doc! { "x": 1 }, options).await.unwrap();

    let inserts = server.received_with_name("insert");
    assert_eq!(inserts.len(), 1);
    assert!(inserts[0].get_document("lsid").is_err());
    assert!(inserts[0].get("txnNumber").is_none());
}

#[tokio::test]
async fn retryable_write_retries_once_with_the_same_txn_number() {
    let server = MockServer::start().await;
    // Fail the next insert with a retryable state-change error, once.
    server.queue_reply(
        "insert",
        doc! {
            "ok": 0,
            "code": 10107,
            "codeName": "NotWritablePrimary",
            "errmsg": "node is not in primary or recovering state",
        },
    );

    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let result = coll.insert_one(doc! { "_id": 1 }, None).await.unwrap();
    assert_eq!(result.inserted_id, Bson::Int32(1));

    let inserts = server.received_with_name("insert");
    assert_eq!(inserts.len(), 2, "expected exactly one retry");

    let first_txn = inserts[0].get_i64("txnNumber").unwrap();
    let second_txn = inserts[1].get_i64("txnNumber").unwrap();
    assert_eq!(first_txn, second_txn, "retry must reuse the txnNumber");
    assert_eq!(
        inserts[0].get_document("lsid").unwrap(),
        inserts[1].get_document("lsid").unwrap(),
        "retry must reuse the session",
    );
}

#[tokio::test]
async fn non_retryable_errors_are_surfaced_without_retry() {
    let server = MockServer::start().await;
    server.queue_reply(
        "insert",
        doc! { "ok": 0, "code": 11000, "codeName": "DuplicateKey", "errmsg": "E11000" },
    );

    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let err = coll.insert_one(doc! { "_id": 1 }, None).await.unwrap_err();
    match err.kind.as_ref() {
        ErrorKind::Command(command_error) => assert_eq!(command_error.code, 11000),
        other => panic!("expected command error, got {:?}", other),
    }
    assert_eq!(server.received_with_name("insert").len(), 1);
}

#[tokio::test]
async fn causally_consistent_reads_carry_after_cluster_time() {
    let server = MockServer::start().await;
    let operation_time = Timestamp {
        time: 42,
        increment: 7,
    };
    let cluster_time = doc! {
        "clusterTime": Bson::Timestamp(Timestamp { time: 42, increment: 9 }),
        "signature": { "hash": "00", "keyId": 0_i64 },
    };
    server.queue_reply(
        "insert",
        doc! {
            "ok": 1,
            "n": 1,
            "operationTime": Bson::Timestamp(operation_time),
            "$clusterTime": cluster_time.clone(),
        },
    );

    server.queue_reply(
        "find",
        doc! {
            "ok": 1,
            "cursor": { "id": 0_i64, "ns": "db.coll", "firstBatch": [ { "_id": 1 } ] },
        },
    );

    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let mut session = client.start_session(None).await.unwrap();
    coll.insert_one_with_session(doc! { "_id": 1 }, None, &mut session)
        .await
        .unwrap();
    assert_eq!(session.operation_time(), Some(operation_time));

    let found: Option<Document> = coll
        .find_one_with_session(doc! { "_id": 1 }, None, &mut session)
        .await
        .unwrap();
    assert!(found.is_some());

    let finds = server.received_with_name("find");
    assert_eq!(finds.len(), 1);
    let read_concern = finds[0].get_document("readConcern").unwrap();
    assert_eq!(
        read_concern.get("afterClusterTime"),
        Some(&Bson::Timestamp(operation_time)),
        "causally consistent read must carry the session's operation time",
    );
    // The client gossips the highest cluster time it has seen.
    assert_eq!(
        finds[0].get_document("$clusterTime").unwrap(),
        &cluster_time,
    );
}

#[tokio::test]
async fn dropping_a_live_cursor_fires_kill_cursors() {
    let server = MockServer::start().await;
    server.queue_reply(
        "find",
        doc! {
            "ok": 1,
            "cursor": {
                "id": 99_i64,
                "ns": "db.coll",
                "firstBatch": [ { "_id": 1 } ],
            },
        },
    );

    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let mut cursor = coll.find(doc! {}, None).await.unwrap();
    let (tx, rx) = oneshot::channel();
    cursor.set_kill_watcher(tx);

    let first: Document = cursor.next().await.unwrap().unwrap();
    assert_eq!(first, doc! { "_id": 1 });

    drop(cursor);
    rx.await.unwrap();

    let kills = server.received_with_name("killCursors");
    assert_eq!(kills.len(), 1);
    assert_eq!(
        kills[0].get_array("cursors").unwrap(),
        &vec![Bson::Int64(99)],
    );
}

#[tokio::test]
async fn change_stream_resumes_with_the_last_seen_token() {
    let server = MockServer::start().await;

    let token1 = doc! { "_data": "token-1" };
    let token2 = doc! { "_data": "token-2" };

    server.queue_reply(
        "aggregate",
        doc! {
            "ok": 1,
            "cursor": {
                "id": 7_i64,
                "ns": "db.coll",
                "firstBatch": [ {
                    "_id": token1.clone(),
                    "operationType": "insert",
                    "fullDocument": { "_id": 1 },
                } ],
            },
        },
    );
    // The server kills the cursor out from under the stream.
    server.queue_reply(
        "getMore",
        doc! { "ok": 0, "code": 43, "codeName": "CursorNotFound", "errmsg": "cursor killed" },
    );
    server.queue_reply(
        "aggregate",
        doc! {
            "ok": 1,
            "cursor": {
                "id": 8_i64,
                "ns": "db.coll",
                "firstBatch": [ {
                    "_id": token2.clone(),
                    "operationType": "insert",
                    "fullDocument": { "_id": 2 },
                } ],
            },
        },
    );

    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let mut stream = coll.watch(vec![], None).await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.full_document, Some(doc! { "_id": 1 }));
    assert_eq!(stream.resume_token().unwrap().as_bson(), &Bson::Document(token1.clone()));

    // The next poll hits the killed cursor and must resume transparently.
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.full_document, Some(doc! { "_id": 2 }));

    let aggregates = server.received_with_name("aggregate");
    assert_eq!(aggregates.len(), 2, "expected the stream to re-aggregate once");

    let pipeline = aggregates[1].get_array("pipeline").unwrap();
    let stage = match &pipeline[0] {
        Bson::Document(doc) => doc.get_document("$changeStream").unwrap(),
        other => panic!("expected $changeStream stage, got {:?}", other),
    };
    assert_eq!(
        stage.get("resumeAfter"),
        Some(&Bson::Document(token1)),
        "resume must re-issue the aggregate with the last seen token",
    );
}

#[tokio::test]
async fn insert_many_splits_batches_by_message_size() {
    // Advertise a message limit that fits roughly two 1KB documents beyond
    // the command overhead allowance.
    let mut hello = MockServer::primary_hello_template();
    hello.insert("maxMessageSizeBytes", 16_000 + 2_200);
    let server = MockServer::start_with_hello(hello).await;

    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let docs: Vec<Document> = (0..4)
        .map(|i| doc! { "i": i, "payload": "x".repeat(1000) })
        .collect();
    let result = coll.insert_many(docs, None).await.unwrap();

    // Every input index is accounted for exactly once.
    let mut indices: Vec<usize> = result.inserted_ids.keys().copied().collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    let inserts = server.received_with_name("insert");
    assert!(
        inserts.len() >= 2,
        "expected the batch to split into multiple insert commands, got {}",
        inserts.len()
    );
    let total_documents: usize = inserts
        .iter()
        .map(|body| body.get_array("documents").unwrap().len())
        .sum();
    assert_eq!(total_documents, 4);

    // Distinct sub-batches allocate distinct transaction numbers.
    let mut txn_numbers: Vec<i64> = inserts
        .iter()
        .map(|body| body.get_i64("txnNumber").unwrap())
        .collect();
    txn_numbers.sort_unstable();
    txn_numbers.dedup();
    assert_eq!(txn_numbers.len(), inserts.len());
}

#[tokio::test]
async fn retryable_reads_retry_find_once() {
    let server = MockServer::start().await;
    server.queue_reply(
        "find",
        doc! { "ok": 0, "code": 11600, "codeName": "InterruptedAtShutdown", "errmsg": "shutdown" },
    );

    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let found: Option<Document> = coll.find_one(doc! { "_id": 1 }, None).await.unwrap();
    assert!(found.is_none());

    assert_eq!(server.received_with_name("find").len(), 2);
}

#[tokio::test]
async fn run_command_never_swallows_ok_zero() {
    let server = MockServer::start().await;
    server.queue_reply(
        "ping",
        doc! { "ok": 0, "code": 8000, "codeName": "AtlasError", "errmsg": "no" },
    );

    let client = client_for(&server).await;
    let err = client
        .database("db")
        .run_command(doc! { "ping": 1 }, None)
        .await
        .unwrap_err();
    match err.kind.as_ref() {
        ErrorKind::Command(command_error) => {
            assert_eq!(command_error.code, 8000);
            assert_eq!(command_error.code_name, "AtlasError");
        }
        other => panic!("expected command error, got {:?}", other),
    }
}

#[tokio::test]
async fn cursor_iterates_across_get_more_batches() {
    let server = MockServer::start().await;
    server.queue_reply(
        "find",
        doc! {
            "ok": 1,
            "cursor": { "id": 5_i64, "ns": "db.coll", "firstBatch": [ { "i": 0 }, { "i": 1 } ] },
        },
    );
    server.queue_reply(
        "getMore",
        doc! {
            "ok": 1,
            "cursor": { "id": 0_i64, "ns": "db.coll", "nextBatch": [ { "i": 2 } ] },
        },
    );

    let client = client_for(&server).await;
    let coll = client.database("db").collection("coll");

    let cursor = coll.find(doc! {}, None).await.unwrap();
    let docs: Vec<Document> = cursor.try_collect().await.unwrap();
    assert_eq!(docs.len(), 3);
    assert_eq!(docs[2], doc! { "i": 2 });

    let get_mores = server.received_with_name("getMore");
    assert_eq!(get_mores.len(), 1);
    assert_eq!(get_mores[0].get_i64("getMore").unwrap(), 5);
}
