//! # Context Lifecycle
//!
//! Dial outcomes, close semantics and handler callbacks.

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use futures_util::future::join_all;
    use std::sync::Arc;
    use std::time::Duration;
    use wire_bus::{
        Bus, BusError, ContextState, MemoryTransport, PromiseState, ReconnectPolicy, Role,
        TransportError, TransportKind,
    };

    fn mem_bus() -> Bus {
        Bus::new().with_transport(TransportKind::Mem, Arc::new(MemoryTransport::new()))
    }

    #[tokio::test]
    async fn test_concurrent_dials_with_same_key_yield_one_context() {
        let bus = mem_bus();
        bus.serve(None, [silent(config("svc", TransportKind::Mem, 7300))])
            .await;

        let endpoint = silent(config("cli", TransportKind::Mem, 7300));
        let results = join_all((0..8).map(|_| bus.dial(endpoint.clone()))).await;

        let successes = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(successes, 1);
        for result in results.iter().filter(|result| result.is_err()) {
            assert!(matches!(
                result,
                Err(BusError::EndpointAlreadyRegistered(key)) if key == "cli-127.0.0.1:7300-mem"
            ));
        }
        assert_eq!(bus.registry().len(Role::Initiator), 1);

        bus.stop(None).await;
    }

    #[tokio::test]
    async fn test_unreachable_without_reconnect_fails_dial() {
        let bus = mem_bus();
        let err = bus
            .dial(silent(config("cli", TransportKind::Mem, 7301).with_buffer_size(1)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BusError::Transport(TransportError::ConnectionRefused { .. })
        ));
        assert!(bus.registry().is_empty());
        assert!(bus.lookup("cli-127.0.0.1:7301-mem").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_dial_releases_identity_key() {
        let gate = Arc::new(Gate::new(MemoryTransport::new()));
        let bus = Bus::new().with_transport(TransportKind::Mem, gate.clone());
        bus.serve(None, [silent(config("svc", TransportKind::Mem, 7305))])
            .await;
        let endpoint = silent(config("cli", TransportKind::Mem, 7305));

        gate.stall();
        let abandoned = tokio::time::timeout(Duration::from_millis(50), bus.dial(endpoint.clone())).await;
        assert!(abandoned.is_err());
        assert_eq!(bus.registry().len(Role::Initiator), 0);

        // a second attempt reaches the transport instead of the stale key
        let again = tokio::time::timeout(Duration::from_millis(50), bus.dial(endpoint.clone())).await;
        assert!(again.is_err());

        gate.resume();
        let client = bus.dial(endpoint).await.unwrap();
        assert_eq!(client.state(), ContextState::Open);
        assert_eq!(client.key(), "cli-127.0.0.1:7305-mem");

        bus.stop(None).await;
    }

    #[tokio::test]
    async fn test_cancelled_serve_releases_listener_id() {
        let gate = Arc::new(Gate::new(MemoryTransport::new()));
        let bus = Bus::new().with_transport(TransportKind::Mem, gate.clone());
        let (on_error, mut errors) = error_channel();

        gate.stall();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            bus.serve(None, [silent(config("svc", TransportKind::Mem, 7306))]),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(bus.registry().is_empty());

        gate.resume();
        bus.serve(
            Some(on_error),
            [silent(config("svc", TransportKind::Mem, 7306))],
        )
        .await;
        assert_eq!(bus.registry().listener_ids(), vec!["svc".to_string()]);
        assert!(errors.try_recv().is_err());

        bus.stop(None).await;
    }

    #[tokio::test]
    async fn test_unreachable_tcp_fails_dial() {
        // grab a free port, then release it so nothing listens there
        let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = vacant.local_addr().unwrap().port();
        drop(vacant);

        let bus = Bus::new();
        let result = bus.dial(silent(config("cli", TransportKind::Tcp, port))).await;

        assert!(matches!(result, Err(BusError::Transport(_))));
        assert!(bus.registry().is_empty());
    }

    #[tokio::test]
    async fn test_close_cancels_queued_and_is_idempotent() {
        let bus = mem_bus();
        // nothing listens, so the supervisor keeps the context in Opening
        let endpoint = silent(
            config("cli", TransportKind::Mem, 7302)
                .with_reconnect(ReconnectPolicy::new(0, Duration::from_secs(3600))),
        );
        let client = bus.dial(endpoint).await.unwrap();
        assert_eq!(client.state(), ContextState::Opening);

        let queued = client.send(&Ping::new(1)).await;
        assert_eq!(queued.state(), PromiseState::Queued);

        client.close();
        assert_eq!(queued.wait().await, PromiseState::Cancelled);
        assert_eq!(client.closed().await, ContextState::Closed);

        client.close();
        assert_eq!(client.state(), ContextState::Closed);
        assert_eq!(
            client.send(&Ping::new(2)).await.state(),
            PromiseState::Cancelled
        );
        assert!(bus.registry().is_empty());
    }

    #[tokio::test]
    async fn test_context_handler_brackets_message_handling() {
        let bus = mem_bus();
        let journal = Arc::new(Journal::default());
        let (server, mut inbox) = collecting(config("svc", TransportKind::Mem, 7303));
        bus.serve(
            None,
            [server.with_shared_context_handler(journal.clone())],
        )
        .await;

        let client = bus
            .dial(silent(config("cli", TransportKind::Mem, 7303)))
            .await
            .unwrap();
        client.send(&Ping::new(1)).await;
        let (acceptor_key, _) = next_message(&mut inbox).await.unwrap();

        // opened runs before the first message is dispatched
        assert_eq!(
            *journal.entries.lock(),
            vec![format!("opened:{acceptor_key}")]
        );

        client.close();
        client.closed().await;
        assert!(eventually(|| journal.count("closing:") == 1).await);
        bus.stop(None).await;

        assert_eq!(journal.count("opened:"), 1);
        assert_eq!(journal.count("closing:"), 1);
    }

    #[tokio::test]
    async fn test_lookup_by_key_while_open() {
        let bus = mem_bus();
        bus.serve(None, [silent(config("svc", TransportKind::Mem, 7304))])
            .await;
        let client = bus
            .dial(silent(config("cli", TransportKind::Mem, 7304)))
            .await
            .unwrap();

        let found = bus.lookup(client.key()).unwrap();
        assert_eq!(found.role(), Role::Initiator);
        assert_eq!(found.endpoint_id(), "cli");
        assert_eq!(found.state(), ContextState::Open);

        assert!(eventually(|| bus.registry().acceptors_for("svc").len() == 1).await);
        bus.stop(None).await;
        assert!(bus.lookup(client.key()).is_none());
    }
}
