//! Framing through the whole stack: fragmented and coalesced datagrams.

use crate::{connected, test_config, CannedReply};
use bytes::Bytes;
use trellis_client::RequestOptions;
use trellis_core::message::{Message, MSG_F_DUMP, MSG_F_MULTI};

const GET_ITEMS: u16 = 0x0012;

#[tokio::test]
async fn fragmented_replies_reassemble() {
    let (host, client) = connected(test_config()).await;
    // Every host datagram is split mid-envelope; the reassembler must
    // stitch the halves back together before anything parses.
    host.fragment_at(24);
    host.script(
        GET_ITEMS,
        vec![
            CannedReply::record(0x0010, MSG_F_MULTI, b"fragmented-record"),
            CannedReply::done(),
        ],
    );

    let replies = client
        .request(
            Message::request(GET_ITEMS, MSG_F_DUMP, Bytes::new()),
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body.as_ref(), b"fragmented-record");

    client.release().await.unwrap();
}

#[tokio::test]
async fn coalesced_reply_stream_splits_back_into_envelopes() {
    let (host, client) = connected(test_config()).await;
    // The whole multi-part stream arrives as one blob; the reassembler
    // must walk out each envelope.
    host.coalesce(true);
    host.script(
        GET_ITEMS,
        vec![
            CannedReply::record(0x0010, MSG_F_MULTI, b"one"),
            CannedReply::record(0x0010, MSG_F_MULTI, b"two"),
            CannedReply::done(),
        ],
    );

    let replies = client
        .request(
            Message::request(GET_ITEMS, MSG_F_DUMP, Bytes::new()),
            RequestOptions::default(),
        )
        .await
        .unwrap();
    let bodies: Vec<&[u8]> = replies.iter().map(|m| m.body.as_ref()).collect();
    assert_eq!(bodies, vec![b"one" as &[u8], b"two"]);

    client.release().await.unwrap();
}

#[tokio::test]
async fn coalesced_and_fragmented_at_once() {
    let (host, client) = connected(test_config()).await;
    host.coalesce(true);
    host.fragment_at(40); // split the packed stream at an envelope-unaligned point
    host.script(
        GET_ITEMS,
        vec![
            CannedReply::record(0x0010, MSG_F_MULTI, b"alpha"),
            CannedReply::record(0x0010, MSG_F_MULTI, b"beta"),
            CannedReply::done(),
        ],
    );

    let replies = client
        .request(
            Message::request(GET_ITEMS, MSG_F_DUMP, Bytes::new()),
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(replies.len(), 2);

    client.release().await.unwrap();
}
