//! # Reconnect Supervisor
//!
//! Re-dial behaviour of initiator contexts against the in-memory hub, under
//! paused time so attempt spacing is exact.

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use std::sync::Arc;
    use std::time::Duration;
    use wire_bus::{Bus, ContextState, MemoryTransport, PromiseState, ReconnectPolicy, TransportKind};

    fn mem_bus() -> (Bus, MemoryTransport) {
        let hub = MemoryTransport::new();
        let bus = Bus::new().with_transport(TransportKind::Mem, Arc::new(hub.clone()));
        (bus, hub)
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_exhausts_into_failed() {
        let (bus, hub) = mem_bus();
        let delay = Duration::from_millis(250);
        let endpoint = silent(
            config("cli", TransportKind::Mem, 7400).with_reconnect(ReconnectPolicy::new(3, delay)),
        );

        let client = bus.dial(endpoint).await.unwrap();
        assert_eq!(client.closed().await, ContextState::Failed);

        let attempts = hub.dial_attempts(loopback(7400));
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= delay);
        }
        assert!(bus.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_listener_is_reached() {
        let (bus, hub) = mem_bus();
        let endpoint = silent(
            config("cli", TransportKind::Mem, 7401)
                .with_reconnect(ReconnectPolicy::new(0, Duration::from_millis(100))),
        );
        let client = bus.dial(endpoint).await.unwrap();
        assert_eq!(client.state(), ContextState::Opening);

        let pending = client.send(&Ping::new(1)).await;
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(pending.state(), PromiseState::Queued);

        let (server, mut inbox) = collecting(config("svc", TransportKind::Mem, 7401));
        bus.serve(None, [server]).await;

        wait_for_state(&client, ContextState::Open).await.unwrap();
        assert_eq!(pending.wait().await, PromiseState::Sent);
        assert_eq!(next_message(&mut inbox).await.unwrap().1, Ping::new(1));
        assert!(hub.dial_attempts(loopback(7401)).len() >= 5);

        bus.stop(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_severed_connection_reconnects() {
        let (bus, hub) = mem_bus();
        let (server, mut inbox) = collecting(config("svc", TransportKind::Mem, 7402));
        bus.serve(None, [server]).await;

        let endpoint = silent(
            config("cli", TransportKind::Mem, 7402)
                .with_reconnect(ReconnectPolicy::new(5, Duration::from_millis(100))),
        );
        let client = bus.dial(endpoint).await.unwrap();
        let session = client.session_id();
        client.send(&Ping::new(1)).await.wait().await;
        let (first_acceptor, _) = next_message(&mut inbox).await.unwrap();

        assert_eq!(hub.sever(loopback(7402)), 1);
        wait_for_state(&client, ContextState::Reconnecting).await.unwrap();
        wait_for_state(&client, ContextState::Open).await.unwrap();
        assert_eq!(client.session_id(), session);
        assert_eq!(hub.dial_attempts(loopback(7402)).len(), 2);

        assert_eq!(client.send(&Ping::new(2)).await.wait().await, PromiseState::Sent);
        let (second_acceptor, ping) = next_message(&mut inbox).await.unwrap();
        assert_eq!(ping, Ping::new(2));
        assert_ne!(first_acceptor, second_acceptor);

        bus.stop(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_without_reconnect_closes() {
        let (bus, hub) = mem_bus();
        bus.serve(None, [silent(config("svc", TransportKind::Mem, 7403))])
            .await;
        let client = bus
            .dial(silent(config("cli", TransportKind::Mem, 7403)))
            .await
            .unwrap();

        hub.sever(loopback(7403));
        assert_eq!(client.closed().await, ContextState::Closed);
        assert_eq!(hub.dial_attempts(loopback(7403)).len(), 1);
        assert!(bus.lookup(client.key()).is_none());

        bus.stop(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_queued_while_reconnecting_keep_order() {
        let (bus, hub) = mem_bus();
        let (server, mut inbox) = collecting(config("svc", TransportKind::Mem, 7404));
        bus.serve(None, [server]).await;
        let endpoint = silent(
            config("cli", TransportKind::Mem, 7404)
                .with_reconnect(ReconnectPolicy::new(0, Duration::from_millis(100))),
        );
        let client = bus.dial(endpoint).await.unwrap();

        hub.refuse(loopback(7404));
        assert_eq!(hub.sever(loopback(7404)), 1);
        wait_for_state(&client, ContextState::Reconnecting).await.unwrap();

        let mut promises = Vec::new();
        for seq in 0..5 {
            promises.push(client.send(&Ping::new(seq)).await);
        }
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(client.state(), ContextState::Reconnecting);
        assert!(promises.iter().all(|p| p.state() == PromiseState::Queued));

        hub.restore(loopback(7404));
        wait_for_state(&client, ContextState::Open).await.unwrap();
        for promise in &promises {
            assert_eq!(promise.wait().await, PromiseState::Sent);
        }
        for expected in 0..5 {
            assert_eq!(next_message(&mut inbox).await.unwrap().1.seq, expected);
        }

        bus.stop(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_head_is_retried_first_after_reconnect() {
        let hub = MemoryTransport::new();
        let tripwire = Arc::new(Tripwire::new(hub.clone()));
        let bus = Bus::new().with_transport(TransportKind::Mem, tripwire.clone());
        let (server, mut inbox) = collecting(config("svc", TransportKind::Mem, 7405));
        bus.serve(None, [server]).await;
        let endpoint = silent(
            config("cli", TransportKind::Mem, 7405)
                .with_reconnect(ReconnectPolicy::new(0, Duration::from_millis(100))),
        );
        let client = bus.dial(endpoint).await.unwrap();

        // the first write fails; the rest queue behind it
        let mut promises = Vec::new();
        for seq in 0..5 {
            promises.push(client.send(&Ping::new(seq)).await);
        }
        for promise in &promises {
            assert_eq!(promise.wait().await, PromiseState::Sent);
        }
        assert!(tripwire.tripped());
        assert_eq!(hub.dial_attempts(loopback(7405)).len(), 2);

        for expected in 0..5 {
            assert_eq!(next_message(&mut inbox).await.unwrap().1.seq, expected);
        }
        assert_eq!(client.state(), ContextState::Open);

        bus.stop(None).await;
    }
}
