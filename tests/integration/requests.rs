//! Request/response dispatch: multi-part collection, error surfacing,
//! listener lifecycle.

use crate::{connected, test_config, CannedReply};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use trellis_client::{ClientError, RequestOptions};
use trellis_core::config::ClientConfig;
use trellis_core::message::{Message, MSG_F_DUMP, MSG_F_MULTI};

const GET_ITEMS: u16 = 0x0012;

#[tokio::test]
async fn single_shot_dump_returns_one_record() {
    let (host, client) = connected(test_config()).await;
    host.script(
        GET_ITEMS,
        vec![
            CannedReply::record(0x0010, MSG_F_MULTI, b"link0"),
            CannedReply::done(),
        ],
    );

    let msg = Message::request(GET_ITEMS, MSG_F_DUMP, Bytes::new());
    let replies = client
        .request(msg, RequestOptions::default())
        .await
        .expect("dump");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body.as_ref(), b"link0");
    // Transport headers are stripped outside debug mode.
    assert!(replies[0].header.is_none());

    client.release().await.unwrap();
}

#[tokio::test]
async fn multi_part_stream_collects_everything_before_done() {
    let (host, client) = connected(test_config()).await;
    host.script(
        GET_ITEMS,
        vec![
            CannedReply::record(0x0010, MSG_F_MULTI, b"a"),
            CannedReply::record(0x0010, MSG_F_MULTI, b"b"),
            CannedReply::record(0x0010, MSG_F_MULTI, b"c"),
            CannedReply::done(),
        ],
    );

    let msg = Message::request(GET_ITEMS, MSG_F_DUMP, Bytes::new());
    let replies = client.request(msg, RequestOptions::default()).await.unwrap();
    let bodies: Vec<&[u8]> = replies.iter().map(|m| m.body.as_ref()).collect();
    assert_eq!(bodies, vec![b"a" as &[u8], b"b", b"c"]);

    client.release().await.unwrap();
}

#[tokio::test]
async fn non_multi_reply_terminates_after_first_record() {
    let (host, client) = connected(test_config()).await;
    host.script(GET_ITEMS, vec![CannedReply::record(0x0010, 0, b"only")]);

    let msg = Message::request(GET_ITEMS, 0, Bytes::new());
    let replies = client.request(msg, RequestOptions::default()).await.unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body.as_ref(), b"only");

    client.release().await.unwrap();
}

#[tokio::test]
async fn missing_done_times_out() {
    let (host, client) = connected(test_config()).await;
    // MULTI stream with no terminator: the dispatcher must keep waiting
    // and eventually give up.
    host.script(
        GET_ITEMS,
        vec![CannedReply::record(0x0010, MSG_F_MULTI, b"endless")],
    );

    let msg = Message::request(GET_ITEMS, MSG_F_DUMP, Bytes::new());
    let err = client
        .request(
            msg,
            RequestOptions {
                timeout: Some(Duration::from_millis(100)),
                ..RequestOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout));

    client.release().await.unwrap();
}

#[tokio::test]
async fn error_reply_raises_request_failed() {
    let (host, client) = connected(test_config()).await;
    host.script(GET_ITEMS, vec![CannedReply::failure(17)]);

    let msg = Message::request(GET_ITEMS, 0, Bytes::new());
    let err = client
        .request(msg, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::RequestFailed(17)));

    client.release().await.unwrap();
}

#[tokio::test]
async fn error_reply_with_raw_returns_the_record() {
    let (host, client) = connected(test_config()).await;
    host.script(GET_ITEMS, vec![CannedReply::failure(17)]);

    let msg = Message::request(GET_ITEMS, 0, Bytes::new());
    let replies = client
        .request(
            msg,
            RequestOptions {
                raw: true,
                ..RequestOptions::default()
            },
        )
        .await
        .expect("raw mode returns failure reports");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].error, Some(17));

    client.release().await.unwrap();
}

#[tokio::test]
async fn debug_mode_keeps_transport_headers() {
    let config = ClientConfig {
        debug: true,
        ..test_config()
    };
    let (host, client) = connected(config).await;
    host.script(GET_ITEMS, vec![CannedReply::record(0x0010, 0, b"kept")]);

    let msg = Message::request(GET_ITEMS, 0, Bytes::new());
    let replies = client.request(msg, RequestOptions::default()).await.unwrap();
    let header = replies[0].header.expect("debug mode keeps headers");
    assert_eq!(header.kind, 0x0010);

    client.release().await.unwrap();
}

#[tokio::test]
async fn concurrent_requests_stay_correlated() {
    let (host, client) = connected(test_config()).await;
    const KIND_A: u16 = 0x0020;
    const KIND_B: u16 = 0x0022;
    host.script(
        KIND_A,
        vec![CannedReply::record(0x0010, MSG_F_MULTI, b"from-a"), CannedReply::done()],
    );
    host.script(
        KIND_B,
        vec![CannedReply::record(0x0010, MSG_F_MULTI, b"from-b"), CannedReply::done()],
    );

    let client = Arc::new(client);
    let a = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request(
                    Message::request(KIND_A, MSG_F_DUMP, Bytes::new()),
                    RequestOptions::default(),
                )
                .await
        })
    };
    let b = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request(
                    Message::request(KIND_B, MSG_F_DUMP, Bytes::new()),
                    RequestOptions::default(),
                )
                .await
        })
    };

    let replies_a = a.await.unwrap().unwrap();
    let replies_b = b.await.unwrap().unwrap();
    assert_eq!(replies_a[0].body.as_ref(), b"from-a");
    assert_eq!(replies_b[0].body.as_ref(), b"from-b");

    client.release().await.unwrap();
}
