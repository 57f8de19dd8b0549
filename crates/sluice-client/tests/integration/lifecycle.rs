//! Handshake, completion, cancellation, and protocol-violation handling.

use std::time::Duration;

use sluice_flow::{Delivery, Phase, ResourceItem, Terminal};
use sluice_protocol::ProtocolMessage;

use crate::harness::*;

#[tokio::test]
async fn test_duplicate_subscribed_is_ignored() {
    let (client, _broker, mut conns) = mock_client(test_config(1));
    let stream = client.subscribe(TOKEN).await.unwrap();
    let mut server = next_conn(&mut conns).await;

    server.handshake(false).await;
    server.send(subscribed(false)).await;
    server.offer(resource_msg("file0")).await;

    assert!(matches!(next_delivery(&stream).await, Delivery::Item(_)));
    assert_eq!(stream.phase(), Phase::Waiting);
    assert_eq!(stream.stats().violations, 0);
}

#[tokio::test]
async fn test_complete_ends_stream_and_closes() {
    let (client, _broker, mut conns) = mock_client(test_config(1));
    let stream = client.subscribe(TOKEN).await.unwrap();
    let mut server = next_conn(&mut conns).await;

    server.handshake(false).await;
    server.offer(resource_msg("file0")).await;
    server.offer(error_msg("test error")).await;
    server.send(complete()).await;

    assert!(matches!(
        next_delivery(&stream).await,
        Delivery::Item(ResourceItem::Resource(_))
    ));
    match next_delivery(&stream).await {
        Delivery::Item(ResourceItem::Error { seq, text, .. }) => {
            assert_eq!(seq, 2);
            assert_eq!(text, "test error");
        }
        other => panic!("expected error item, got {other:?}"),
    }
    assert_eq!(next_delivery(&stream).await, Delivery::End(Terminal::Complete));
    // The marker repeats.
    assert_eq!(next_delivery(&stream).await, Delivery::End(Terminal::Complete));

    // No frame after COMPLETE, then the connection closes.
    assert!(server.until_closed().await.is_empty());
    assert_eq!(stream.finished().await, Terminal::Complete);
    assert!(client.active_tokens().await.is_empty());
}

#[tokio::test]
async fn test_cancel_after_first_resource() {
    let (client, _broker, mut conns) = mock_client(test_config(1));
    let stream = client.subscribe(TOKEN).await.unwrap();
    let mut server = next_conn(&mut conns).await;

    server.handshake(false).await;
    server.offer(resource_msg("file0")).await;
    assert!(matches!(next_delivery(&stream).await, Delivery::Item(_)));

    stream.cancel();
    server.try_send(rts()).await;

    let after_cancel = server.until_closed().await;
    assert!(
        !after_cancel
            .iter()
            .any(|m| matches!(m, ProtocolMessage::ClearToSend { .. })),
        "CTS after cancel: {after_cancel:?}"
    );
    assert_eq!(next_delivery(&stream).await, Delivery::End(Terminal::Cancelled));
    assert_eq!(stream.stats().cts_sent, 1);
}

#[tokio::test]
async fn test_cancel_through_client_registry() {
    let (client, _broker, mut conns) = mock_client(test_config(1));
    let stream = client.subscribe(TOKEN).await.unwrap();
    let mut server = next_conn(&mut conns).await;
    server.handshake(false).await;

    assert_eq!(client.active_tokens().await, vec![TOKEN.to_string()]);
    assert!(client.cancel(TOKEN).await);
    assert_eq!(next_delivery(&stream).await, Delivery::End(Terminal::Cancelled));
    assert!(server.until_closed().await.is_empty());
}

#[tokio::test]
async fn test_second_subscribe_for_same_token_rejected() {
    let (client, _broker, mut conns) = mock_client(test_config(1));
    let _stream = client.subscribe(TOKEN).await.unwrap();
    let _server = next_conn(&mut conns).await;

    let err = client.subscribe(TOKEN).await.unwrap_err();
    assert!(err.to_string().contains("already active"));
}

#[tokio::test]
async fn test_dropping_stream_cancels() {
    let (client, _broker, mut conns) = mock_client(test_config(1));
    let stream = client.subscribe(TOKEN).await.unwrap();
    let mut server = next_conn(&mut conns).await;
    server.handshake(false).await;

    drop(stream);
    assert!(server.until_closed().await.is_empty());

    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !client.active_tokens().await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "registry never emptied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_violations_are_ignored() {
    let (client, _broker, mut conns) = mock_client(test_config(1));
    let stream = client.subscribe(TOKEN).await.unwrap();
    let mut server = next_conn(&mut conns).await;
    server.handshake(false).await;

    // RESOURCE without RTS/CTS, and a frame for someone else's token.
    server.send(resource_msg("sneaky")).await;
    server
        .send(ProtocolMessage::ReadyToSend {
            token: "other-token".into(),
        })
        .await;
    server.expect_silence(Duration::from_millis(150)).await;

    server.offer(resource_msg("file0")).await;
    match next_delivery(&stream).await {
        Delivery::Item(ResourceItem::Resource(r)) => {
            assert_eq!(r.leaf_resource_id, "file0");
            assert_eq!(r.seq, 1);
        }
        other => panic!("expected file0, got {other:?}"),
    }
    assert_eq!(stream.stats().violations, 2);
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let (client, _broker, mut conns) = mock_client(test_config(1));
    let _stream = client.subscribe(TOKEN).await.unwrap();
    let mut server = next_conn(&mut conns).await;
    server.handshake(false).await;

    server
        .send(ProtocolMessage::Ping {
            token: TOKEN.into(),
        })
        .await;
    server.expect(ProtocolMessage::pong(TOKEN)).await;
}

#[tokio::test]
async fn test_consume_callback_sees_all_in_order() {
    let (client, _broker, mut conns) = mock_client(test_config(1));
    let stream = client.subscribe(TOKEN).await.unwrap();
    let mut server = next_conn(&mut conns).await;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let consumer = stream.consume(move |d| {
        let _ = seen_tx.send(d);
    });

    server.handshake(false).await;
    server.offer(resource_msg("file0")).await;
    server.offer(resource_msg("file1")).await;
    server.send(complete()).await;

    assert_eq!(consumer.await.unwrap(), Terminal::Complete);
    let mut seqs = Vec::new();
    while let Ok(Delivery::Item(item)) = seen_rx.try_recv() {
        seqs.push(item.seq());
    }
    assert_eq!(seqs, vec![1, 2]);
}
