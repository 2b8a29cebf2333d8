//! # Delivery
//!
//! Ordering and promise outcomes across a live in-memory connection.

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use std::sync::Arc;
    use std::time::Duration;
    use wire_bus::{
        Bus, ContextState, MemoryTransport, PromiseState, ThrottleStrategy, ThrottlingCriteria,
        TransportKind,
    };

    fn mem_bus() -> Bus {
        Bus::new().with_transport(TransportKind::Mem, Arc::new(MemoryTransport::new()))
    }

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let bus = mem_bus();
        let (server, mut inbox) = collecting(config("svc", TransportKind::Mem, 7200));
        bus.serve(None, [server]).await;

        let client = bus
            .dial(silent(config("cli", TransportKind::Mem, 7200)))
            .await
            .unwrap();

        let mut promises = Vec::new();
        for seq in 0..100 {
            promises.push(client.send(&Ping::new(seq)).await);
        }
        for promise in &promises {
            assert_eq!(promise.wait().await, PromiseState::Sent);
        }

        for expected in 0..100 {
            let (_, ping) = next_message(&mut inbox).await.unwrap();
            assert_eq!(ping.seq, expected);
        }

        bus.stop(None).await;
    }

    #[tokio::test]
    async fn test_a_then_b_both_sent_in_order() {
        let bus = mem_bus();
        let (server, mut inbox) = collecting(config("svc", TransportKind::Mem, 7201));
        bus.serve(None, [server]).await;
        let client = bus
            .dial(silent(config("cli", TransportKind::Mem, 7201)))
            .await
            .unwrap();

        let a = client.send(&Ping::new(1)).await;
        let b = client.send(&Ping::new(2)).await;
        assert_ne!(a.id(), b.id());
        assert_eq!(a.context_key(), client.key());

        assert_eq!(a.wait().await, PromiseState::Sent);
        assert_eq!(b.wait().await, PromiseState::Sent);
        assert_eq!(next_message(&mut inbox).await.unwrap().1, Ping::new(1));
        assert_eq!(next_message(&mut inbox).await.unwrap().1, Ping::new(2));

        bus.stop(None).await;
    }

    #[tokio::test]
    async fn test_acceptor_replies_reach_initiator() {
        let bus = mem_bus();
        bus.serve(None, [echoing(config("svc", TransportKind::Mem, 7202))])
            .await;
        let (client, mut replies) = collecting(config("cli", TransportKind::Mem, 7202));
        let client = bus.dial(client).await.unwrap();

        client.send(&Ping::new(7)).await;
        let (key, reply) = next_message(&mut replies).await.unwrap();
        assert_eq!(key, client.key());
        assert_eq!(reply, Ping::new(7));

        bus.stop(None).await;
    }

    #[tokio::test]
    async fn test_on_complete_fires_once_with_final_state() {
        let bus = mem_bus();
        bus.serve(None, [silent(config("svc", TransportKind::Mem, 7203))])
            .await;
        let client = bus
            .dial(silent(config("cli", TransportKind::Mem, 7203)))
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let promise = client.send(&Ping::new(1)).await;
        promise.on_complete(move |state| {
            let _ = tx.send(state);
        });

        assert_eq!(rx.recv().await, Some(PromiseState::Sent));
        assert_eq!(rx.recv().await, None);

        bus.stop(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_throttle_paces_sends() {
        let bus = mem_bus();
        let (server, mut inbox) = collecting(config("svc", TransportKind::Mem, 7204));
        bus.serve(None, [server]).await;

        let throttled = config("cli", TransportKind::Mem, 7204).with_throttling(ThrottlingCriteria {
            strategy: ThrottleStrategy::MessagesPerSecond,
            incoming_limit_per_second: 0,
            outgoing_limit_per_second: 5,
        });
        let client = bus.dial(silent(throttled)).await.unwrap();

        let start = tokio::time::Instant::now();
        for seq in 0..15 {
            client.send(&Ping::new(seq)).await;
        }
        // a full bucket covers the first five, the rest refill at 5/s
        assert!(start.elapsed() >= Duration::from_millis(1_900));

        for expected in 0..15 {
            assert_eq!(next_message(&mut inbox).await.unwrap().1.seq, expected);
        }

        bus.stop(None).await;
    }

    #[tokio::test]
    async fn test_failed_write_without_reconnect_fails_transport() {
        let tripwire = Arc::new(Tripwire::new(MemoryTransport::new()));
        let bus = Bus::new().with_transport(TransportKind::Mem, tripwire.clone());
        bus.serve(None, [silent(config("svc", TransportKind::Mem, 7205))])
            .await;
        let client = bus
            .dial(silent(config("cli", TransportKind::Mem, 7205)))
            .await
            .unwrap();

        let promise = client.send(&Ping::new(1)).await;
        assert_eq!(promise.wait().await, PromiseState::FailedTransport);
        assert!(tripwire.tripped());
        assert_eq!(client.closed().await, ContextState::Closed);
        assert!(bus.lookup(client.key()).is_none());

        bus.stop(None).await;
    }

    #[tokio::test]
    async fn test_unencodable_message_fails_serialization() {
        let bus = mem_bus();
        let (server, mut inbox) = collecting(config("svc", TransportKind::Mem, 7206));
        bus.serve(None, [server]).await;
        let (client, _replies) = collecting_with(config("cli", TransportKind::Mem, 7206), NonEmptyBody);
        let client = bus.dial(client).await.unwrap();

        let rejected = client
            .send(&Ping {
                seq: 1,
                body: String::new(),
            })
            .await;
        assert_eq!(rejected.state(), PromiseState::FailedSerialization);
        assert_eq!(rejected.context_key(), client.key());

        // nothing was written and the context stays usable
        assert_eq!(client.send(&Ping::new(2)).await.wait().await, PromiseState::Sent);
        assert_eq!(next_message(&mut inbox).await.unwrap().1, Ping::new(2));
        assert_eq!(client.state(), ContextState::Open);

        bus.stop(None).await;
    }
}
