//! Integration tests for the bulk-ingestion paths.
//!
//! Each test scripts the server side of the exchange over an in-process
//! duplex pipe, so the full LOCAL INFILE sub-protocol runs without a
//! database container: statement, request packet, framed data, trailer,
//! final OK/ERR.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mysql_bulk::protocol::packet::{Capabilities, CLIENT_LOCAL_FILES, CLIENT_PROTOCOL_41};
use mysql_bulk::{
    BulkCopy, BulkCopyColumnMapping, BulkLoader, EncodeError, Error, MemoryTable, RowSource,
    Session, SourceColumn, Value, ValueType,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

const MAX_PACKET: usize = 16 * 1024 * 1024;

fn caps() -> Capabilities {
    Capabilities(CLIENT_PROTOCOL_41 | CLIENT_LOCAL_FILES)
}

fn session_pair(max_allowed_packet: usize) -> (Session<DuplexStream>, DuplexStream) {
    let (client, server) = tokio::io::duplex(1 << 20);
    (
        Session::from_parts(client, caps(), max_allowed_packet),
        server,
    )
}

// ============================================================================
// Scripted server
// ============================================================================

async fn read_frame(io: &mut DuplexStream) -> (usize, u8, Vec<u8>) {
    let mut header = [0u8; 4];
    io.read_exact(&mut header).await.unwrap();
    let len = (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
    let seq = header[3];
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await.unwrap();
    (len, seq, payload)
}

async fn write_frame(io: &mut DuplexStream, seq: u8, payload: &[u8]) {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push((payload.len() & 0xff) as u8);
    frame.push(((payload.len() >> 8) & 0xff) as u8);
    frame.push(((payload.len() >> 16) & 0xff) as u8);
    frame.push(seq);
    frame.extend_from_slice(payload);
    io.write_all(&frame).await.unwrap();
}

fn ok_payload(affected: u64) -> Vec<u8> {
    assert!(affected < 251, "test helper only encodes 1-byte counts");
    vec![0x00, affected as u8, 0x00, 0x00, 0x00, 0x00, 0x00]
}

fn err_payload(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut payload = vec![0xff];
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(state.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    payload
}

fn column_payload(name: &str, column_type: u8, character_set: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    for field in ["def", "db", "t", "t", name, name] {
        payload.push(field.len() as u8);
        payload.extend_from_slice(field.as_bytes());
    }
    payload.push(0x0c);
    payload.extend_from_slice(&character_set.to_le_bytes());
    payload.extend_from_slice(&255u32.to_le_bytes());
    payload.push(column_type);
    payload.extend_from_slice(&0u16.to_le_bytes()); // flags
    payload.push(0); // decimals
    payload.extend_from_slice(&0u16.to_le_bytes()); // filler
    payload
}

const EOF_PAYLOAD: &[u8] = &[0xfe, 0x00, 0x00, 0x00, 0x00];

struct InfileExchange {
    sql: String,
    data: Vec<u8>,
    frame_lengths: Vec<usize>,
}

/// Serves one LOAD DATA LOCAL exchange: answers the statement with the
/// local-data request, collects framed data up to the trailer, replies OK.
async fn serve_local_infile(io: &mut DuplexStream, affected: u64) -> InfileExchange {
    let (_, seq, payload) = read_frame(io).await;
    assert_eq!(seq, 0, "statements restart the sequence");
    assert_eq!(payload[0], 0x03, "expected COM_QUERY");
    let sql = String::from_utf8_lossy(&payload[1..]).to_string();

    let mut request = vec![0xfb];
    request.extend_from_slice(b"bulk_copy.csv");
    write_frame(io, 1, &request).await;

    let mut data = Vec::new();
    let mut frame_lengths = Vec::new();
    let mut last_seq = 1u8;
    loop {
        let (len, seq, payload) = read_frame(io).await;
        last_seq = seq;
        frame_lengths.push(len);
        if len == 0 {
            break;
        }
        data.extend_from_slice(&payload);
    }
    write_frame(io, last_seq.wrapping_add(1), &ok_payload(affected)).await;
    InfileExchange {
        sql,
        data,
        frame_lengths,
    }
}

/// Serves a `SELECT * FROM .. LIMIT 0` metadata query.
async fn serve_metadata(io: &mut DuplexStream, columns: &[(&str, u8, u16)]) -> String {
    let (_, _, payload) = read_frame(io).await;
    assert_eq!(payload[0], 0x03);
    let sql = String::from_utf8_lossy(&payload[1..]).to_string();

    let mut seq = 1u8;
    write_frame(io, seq, &[columns.len() as u8]).await;
    for (name, column_type, character_set) in columns {
        seq += 1;
        write_frame(io, seq, &column_payload(name, *column_type, *character_set)).await;
    }
    seq += 1;
    write_frame(io, seq, EOF_PAYLOAD).await; // end of metadata
    seq += 1;
    write_frame(io, seq, EOF_PAYLOAD).await; // end of (empty) rows
    sql
}

/// Serves one plain statement with an OK reply.
async fn serve_ok(io: &mut DuplexStream, affected: u64) -> String {
    let (_, _, payload) = read_frame(io).await;
    let sql = String::from_utf8_lossy(&payload[1..]).to_string();
    write_frame(io, 1, &ok_payload(affected)).await;
    sql
}

fn line_count(data: &[u8]) -> usize {
    data.iter().filter(|b| **b == b'\n').count()
}

// ============================================================================
// Bulk loader
// ============================================================================

#[tokio::test]
async fn test_local_file_load_streams_exact_bytes() {
    let path = std::env::temp_dir().join("mysql_bulk_local_tsv_small.csv");
    let contents = "1,'two-1','three-1'\n2,'two-2','three-2'\n3,'two-3','three-3'\n\
                    4,'two-4','three-4'\n5,'two-5','three-5'\n";
    std::fs::write(&path, contents).unwrap();

    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move { serve_local_infile(&mut server, 5).await });

    let mut loader = BulkLoader::new(&mut session);
    loader.table_name = "dest".to_string();
    loader.file_name = Some(path.to_string_lossy().to_string());
    loader.field_terminator = b",".to_vec();
    loader.field_quotation_character = Some(b'\'');
    loader.field_quotation_optional = true;

    let affected = loader.load().await.unwrap();
    assert_eq!(affected, 5);

    let exchange = server_task.await.unwrap();
    assert!(exchange.sql.starts_with("LOAD DATA LOCAL INFILE"));
    assert!(exchange.sql.contains("INTO TABLE `dest`"));
    assert!(exchange.sql.contains("FIELDS TERMINATED BY ','"));
    assert!(exchange.sql.contains(r"OPTIONALLY ENCLOSED BY '\''"));
    assert_eq!(exchange.data, contents.as_bytes());
    assert_eq!(exchange.frame_lengths, vec![contents.len(), 0]);

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_non_local_missing_file_is_a_server_error() {
    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move {
        let (_, _, payload) = read_frame(&mut server).await;
        let sql = String::from_utf8_lossy(&payload[1..]).to_string();
        let message = "File '/tmp/does-not-exist.csv' not found \
                       (Errcode: 2 \"No such file or directory\")";
        write_frame(&mut server, 1, &err_payload(29, "HY000", message)).await;
        let followup = serve_ok(&mut server, 0).await;
        (sql, followup)
    });

    {
        let mut loader = BulkLoader::new(&mut session);
        loader.table_name = "dest".to_string();
        loader.local = false;
        loader.file_name = Some("/tmp/does-not-exist.csv".to_string());

        let err = loader.load().await.unwrap_err();
        match err {
            Error::Server { code, message, .. } => {
                assert_eq!(code, 29);
                assert!(message.contains("No such file"), "{}", message);
            }
            other => panic!("expected a server error, got {:?}", other),
        }
    }

    // the session is still command-ready
    session.execute("SET @x = 1").await.unwrap();

    let (sql, followup) = server_task.await.unwrap();
    assert!(!sql.contains("LOCAL"));
    assert_eq!(followup, "SET @x = 1");
}

#[tokio::test]
async fn test_local_missing_file_completes_the_sub_protocol() {
    let missing = format!(
        "{}/mysql_bulk_does_not_exist_{}.csv",
        std::env::temp_dir().display(),
        std::process::id()
    );

    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move {
        let exchange = serve_local_infile(&mut server, 0).await;
        let followup = serve_ok(&mut server, 0).await;
        (exchange, followup)
    });

    {
        let mut loader = BulkLoader::new(&mut session);
        loader.table_name = "dest".to_string();
        loader.file_name = Some(missing.clone());
        loader.timeout = Some(Duration::from_secs(3));

        let err = loader.load().await.unwrap_err();
        match err {
            Error::FileNotFound { path, .. } => assert_eq!(path, missing),
            other => panic!("expected FileNotFound, got {:?}", other),
        }
    }

    session.execute("SET @x = 1").await.unwrap();

    let (exchange, _) = server_task.await.unwrap();
    // no data was available, but the trailer still terminated the transfer
    assert_eq!(exchange.frame_lengths, vec![0]);
}

#[tokio::test]
async fn test_load_from_stream_inside_a_transaction() {
    let rows: String = (1..=20).map(|i| format!("{}\trow-{}\n", i, i)).collect();
    let rows_clone = rows.clone();

    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move {
        assert_eq!(serve_ok(&mut server, 0).await, "BEGIN");
        let exchange = serve_local_infile(&mut server, 20).await;
        assert_eq!(exchange.data, rows_clone.as_bytes());
        assert_eq!(serve_ok(&mut server, 0).await, "ROLLBACK");
    });

    session.execute("BEGIN").await.unwrap();
    session.set_in_transaction(true);
    {
        let mut loader = BulkLoader::new(&mut session);
        loader.table_name = "dest".to_string();
        loader.source = Some(Box::new(std::io::Cursor::new(rows.into_bytes())));
        let affected = loader.load().await.unwrap();
        assert_eq!(affected, 20);
    }
    session.execute("ROLLBACK").await.unwrap();
    session.set_in_transaction(false);

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_streaming_packet_boundaries() {
    async fn frame_lengths_for(total: usize) -> Vec<usize> {
        let (mut session, mut server) = session_pair(8);
        let server_task = tokio::spawn(async move { serve_local_infile(&mut server, 0).await });

        let mut loader = BulkLoader::new(&mut session);
        loader.table_name = "t".to_string();
        loader.source = Some(Box::new(std::io::Cursor::new(vec![b'x'; total])));
        loader.load().await.unwrap();

        server_task.await.unwrap().frame_lengths
    }

    // the trailer is the only zero-length frame and is always last
    assert_eq!(frame_lengths_for(0).await, vec![0]);
    assert_eq!(frame_lengths_for(5).await, vec![5, 0]);
    assert_eq!(frame_lengths_for(8).await, vec![8, 0]);
    assert_eq!(frame_lengths_for(16).await, vec![8, 8, 0]);
    assert_eq!(frame_lengths_for(13).await, vec![8, 5, 0]);
}

#[tokio::test]
async fn test_timeout_during_streaming_sends_the_trailer() {
    struct PendingReader;

    impl tokio::io::AsyncRead for PendingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move {
        let exchange = serve_local_infile(&mut server, 0).await;
        let followup = serve_ok(&mut server, 0).await;
        (exchange, followup)
    });

    {
        let mut loader = BulkLoader::new(&mut session);
        loader.table_name = "dest".to_string();
        loader.source = Some(Box::new(PendingReader));
        loader.timeout = Some(Duration::from_millis(100));

        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, Error::Timeout), "got {:?}", err);
    }

    // the final reply was drained despite the expired deadline, so the
    // session is still command-ready
    session.execute("SET @x = 1").await.unwrap();

    let (exchange, followup) = server_task.await.unwrap();
    assert_eq!(exchange.frame_lengths, vec![0]);
    assert_eq!(followup, "SET @x = 1");
}

#[tokio::test]
async fn test_cancellation_before_the_statement() {
    let (mut session, _server) = session_pair(MAX_PACKET);
    let token = CancellationToken::new();
    token.cancel();

    let mut loader = BulkLoader::new(&mut session);
    loader.table_name = "dest".to_string();
    loader.source = Some(Box::new(std::io::Cursor::new(b"1\n".to_vec())));
    loader.cancellation = Some(token);

    let err = loader.load().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled), "got {:?}", err);
}

// ============================================================================
// Bulk copy
// ============================================================================

fn people_table(rows: usize) -> MemoryTable {
    let mut table = MemoryTable::new(vec![
        SourceColumn::new("id", ValueType::Int),
        SourceColumn::new("name", ValueType::Text),
    ]);
    for i in 1..=rows {
        table
            .push_row(vec![
                Value::Int(i as i64),
                Value::Text(format!("row-{}", i)),
            ])
            .unwrap();
    }
    table
}

#[tokio::test]
async fn test_bulk_copy_maps_columns_and_hexes_binary() {
    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move {
        let meta_sql = serve_metadata(
            &mut server,
            &[("id", 0x03, 63), ("name", 0xfd, 45), ("payload", 0xfc, 63)],
        )
        .await;
        let exchange = serve_local_infile(&mut server, 2).await;
        (meta_sql, exchange)
    });

    let mut source = MemoryTable::new(vec![
        SourceColumn::new("id", ValueType::Int),
        SourceColumn::new("name", ValueType::Text),
        SourceColumn::new("payload", ValueType::Bytes),
    ]);
    source
        .push_row(vec![
            Value::Int(1),
            Value::Text("alpha".to_string()),
            Value::Bytes(vec![0xde, 0xad]),
        ])
        .unwrap();
    source
        .push_row(vec![
            Value::Int(2),
            Value::Text("beta".to_string()),
            Value::Null,
        ])
        .unwrap();

    let mut copy = BulkCopy::new(&mut session);
    copy.destination_table_name = "people".to_string();
    let affected = copy.write_to_server(&mut source).await.unwrap();
    assert_eq!(affected, 2);
    assert_eq!(copy.rows_copied(), 2);

    let (meta_sql, exchange) = server_task.await.unwrap();
    assert_eq!(meta_sql, "SELECT * FROM `people` LIMIT 0");
    assert!(exchange
        .sql
        .starts_with("LOAD DATA LOCAL INFILE 'bulk_copy.csv' INTO TABLE `people`"));
    assert!(exchange.sql.contains("CHARACTER SET utf8mb4"));
    assert!(exchange.sql.contains("(`id`, `name`, @col2)"));
    assert!(exchange.sql.contains("SET `payload` = UNHEX(@col2)"));
    assert_eq!(exchange.data, b"1\talpha\tdead\n2\tbeta\t\\N\n");
}

#[tokio::test]
async fn test_bulk_copy_explicit_mapping_reorders_fields() {
    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move {
        serve_metadata(&mut server, &[("one", 0x03, 63), ("two", 0xfd, 45)]).await;
        serve_local_infile(&mut server, 1).await
    });

    let mut source = MemoryTable::new(vec![
        SourceColumn::new("a", ValueType::Text),
        SourceColumn::new("b", ValueType::Int),
    ]);
    source
        .push_row(vec![Value::Text("x".to_string()), Value::Int(9)])
        .unwrap();

    let mut copy = BulkCopy::new(&mut session);
    copy.destination_table_name = "dest".to_string();
    copy.column_mappings = vec![
        BulkCopyColumnMapping::new(1, "one"),
        BulkCopyColumnMapping::new(0, "two"),
    ];
    copy.write_to_server(&mut source).await.unwrap();

    let exchange = server_task.await.unwrap();
    assert!(exchange.sql.contains("(`one`, `two`)"));
    assert_eq!(exchange.data, b"9\tx\n");
}

#[tokio::test]
async fn test_bulk_copy_notify_after_fires_at_boundaries() {
    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move {
        serve_metadata(&mut server, &[("id", 0x03, 63), ("name", 0xfd, 45)]).await;
        serve_local_infile(&mut server, 16).await
    });

    let events: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);

    let mut source = people_table(16);
    let mut copy = BulkCopy::new(&mut session);
    copy.destination_table_name = "people".to_string();
    copy.notify_after = 5;
    copy.on_rows_copied(move |event| {
        seen.lock().unwrap().push(event.rows_copied);
    });

    let affected = copy.write_to_server(&mut source).await.unwrap();
    assert_eq!(affected, 16);
    assert_eq!(copy.rows_copied(), 16);
    assert_eq!(*events.lock().unwrap(), vec![5, 10, 15]);

    let exchange = server_task.await.unwrap();
    assert_eq!(line_count(&exchange.data), 16);
}

#[tokio::test]
async fn test_bulk_copy_abort_stops_after_the_current_row() {
    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move {
        serve_metadata(&mut server, &[("id", 0x03, 63), ("name", 0xfd, 45)]).await;
        serve_local_infile(&mut server, 15).await
    });

    let events: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);

    let mut source = people_table(40);
    let mut copy = BulkCopy::new(&mut session);
    copy.destination_table_name = "people".to_string();
    copy.notify_after = 5;
    copy.on_rows_copied(move |event| {
        seen.lock().unwrap().push(event.rows_copied);
        if event.rows_copied == 15 {
            event.abort = true;
        }
    });

    let affected = copy.write_to_server(&mut source).await.unwrap();
    assert_eq!(affected, 15);
    assert_eq!(copy.rows_copied(), 15);
    assert_eq!(*events.lock().unwrap(), vec![5, 10, 15]);

    let exchange = server_task.await.unwrap();
    assert_eq!(line_count(&exchange.data), 15, "no rows after the abort");
    assert_eq!(*exchange.frame_lengths.last().unwrap(), 0);
}

#[tokio::test]
async fn test_bulk_copy_oversized_value_fails_and_recovers() {
    // 1 MiB packet budget: the hex encoding of the blob alone exceeds it
    let (mut session, mut server) = session_pair(1 << 20);
    let server_task = tokio::spawn(async move {
        serve_metadata(&mut server, &[("a", 0x03, 63), ("b", 0xfb, 63)]).await;
        let exchange = serve_local_infile(&mut server, 0).await;
        let followup = serve_ok(&mut server, 0).await;
        (exchange, followup)
    });

    let mut source = MemoryTable::new(vec![
        SourceColumn::new("a", ValueType::Int),
        SourceColumn::new("b", ValueType::Bytes),
    ]);
    source
        .push_row(vec![Value::Int(1), Value::Bytes(vec![0u8; 524_300])])
        .unwrap();

    {
        let mut copy = BulkCopy::new(&mut session);
        copy.destination_table_name = "blobs".to_string();
        let err = copy.write_to_server(&mut source).await.unwrap_err();
        match &err {
            Error::RowTooLarge { row_index, source } => {
                assert_eq!(*row_index, 0);
                assert_eq!(*source, EncodeError::UnsupportedValue);
            }
            other => panic!("expected RowTooLarge, got {:?}", other),
        }
        // the innermost cause is the unsupported-value condition
        let innermost = std::error::Error::source(&err).unwrap();
        assert!(innermost.downcast_ref::<EncodeError>().is_some());
    }

    session.execute("SET @x = 1").await.unwrap();

    let (exchange, _) = server_task.await.unwrap();
    assert_eq!(exchange.frame_lengths, vec![0], "only the trailer was sent");
}

#[tokio::test]
async fn test_bulk_copy_rejects_empty_destination_before_any_io() {
    let (mut session, _server) = session_pair(MAX_PACKET);
    let mut source = people_table(1);

    let mut copy = BulkCopy::new(&mut session);
    copy.destination_table_name = String::new();
    let err = copy.write_to_server(&mut source).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn test_bulk_copy_from_row_cursor() {
    let (mut session, mut server) = session_pair(MAX_PACKET);
    let server_task = tokio::spawn(async move {
        serve_metadata(&mut server, &[("n", 0x03, 63)]).await;
        serve_local_infile(&mut server, 3).await
    });

    let rows = futures::stream::iter((1..=3i64).map(|i| Ok(vec![Value::Int(i)])));
    let mut cursor = mysql_bulk::RowCursor::new(vec![SourceColumn::new("n", ValueType::Int)], rows);
    assert_eq!(cursor.column_count(), 1);

    let mut copy = BulkCopy::new(&mut session);
    copy.destination_table_name = "numbers".to_string();
    let affected = copy.write_to_server(&mut cursor).await.unwrap();
    assert_eq!(affected, 3);

    let exchange = server_task.await.unwrap();
    assert_eq!(exchange.data, b"1\n2\n3\n");
}
