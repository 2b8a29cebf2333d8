//! # Serving
//!
//! Listener lifecycle: binding, error callbacks and the stop order that
//! closes accepted contexts before their listener.

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use std::sync::Arc;
    use wire_bus::{
        Bus, BusError, ContextState, EndpointConfig, MemEvent, MemoryTransport, Role, TransportKind,
    };

    fn mem_bus() -> (Bus, MemoryTransport) {
        let hub = MemoryTransport::new();
        let bus = Bus::new().with_transport(TransportKind::Mem, Arc::new(hub.clone()));
        (bus, hub)
    }

    #[tokio::test]
    async fn test_stop_serving_all_closes_contexts_before_listeners() {
        let (bus, hub) = mem_bus();
        let journal = Arc::new(Journal::default());
        bus.serve(
            None,
            [
                silent(config("svc-a", TransportKind::Mem, 7500))
                    .with_shared_context_handler(journal.clone()),
                silent(config("svc-b", TransportKind::Mem, 7507))
                    .with_shared_context_handler(journal.clone()),
            ],
        )
        .await;

        let first = bus
            .dial(silent(config("a", TransportKind::Mem, 7500)))
            .await
            .unwrap();
        let second = bus
            .dial(silent(config("b", TransportKind::Mem, 7507)))
            .await
            .unwrap();
        assert!(eventually(|| bus.registry().len(Role::Acceptor) == 2).await);
        assert!(eventually(|| journal.count("opened:") == 2).await);

        bus.stop_serving_all().await;

        assert_eq!(journal.count("closing:"), 2);
        assert_eq!(bus.registry().len(Role::Acceptor), 0);
        assert!(bus.registry().listener_ids().is_empty());
        assert!(!hub.is_listening(loopback(7500)));
        assert!(!hub.is_listening(loopback(7507)));

        let events = hub.events();
        let first_listener_closed = events
            .iter()
            .position(|event| matches!(event, MemEvent::ListenerClosed(_)))
            .unwrap();
        let closed_before = events[..first_listener_closed]
            .iter()
            .filter(|event| matches!(event, MemEvent::ConnectionClosed { .. }))
            .count();
        assert_eq!(closed_before, 2);
        assert_eq!(
            events[first_listener_closed..]
                .iter()
                .filter(|event| matches!(event, MemEvent::ListenerClosed(_)))
                .count(),
            2
        );

        // initiators observe the peer going away
        assert_eq!(first.closed().await, ContextState::Closed);
        assert_eq!(second.closed().await, ContextState::Closed);
    }

    #[tokio::test]
    async fn test_stop_serving_reports_unknown_endpoint() {
        let (bus, _hub) = mem_bus();
        bus.serve(None, [silent(config("svc", TransportKind::Mem, 7501))])
            .await;
        let (callback, mut errors) = error_channel();

        let svc = EndpointConfig::new("svc", TransportKind::Mem);
        bus.stop_serving(Some(callback.clone()), &[svc.clone()]).await;
        bus.stop_serving(Some(callback), &[svc]).await;

        let (id, error) = errors.recv().await.unwrap();
        assert_eq!(id, "svc");
        assert!(matches!(error, BusError::NotServing(ref served) if served == "svc"));
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_serve_errors_go_to_callback() {
        let (bus, _hub) = mem_bus();
        let (callback, mut errors) = error_channel();

        let mut no_transport = config("bare", TransportKind::Mem, 7502);
        no_transport.transport = None;

        bus.serve(
            Some(callback),
            [
                silent(config("svc", TransportKind::Mem, 7503)),
                silent(config("svc", TransportKind::Mem, 7504)),
                silent(no_transport),
                silent(config("web", TransportKind::Ws, 0)),
            ],
        )
        .await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(errors.recv().await.unwrap());
        }
        seen.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(seen[0].0, "bare");
        assert!(matches!(seen[0].1, BusError::MissingDestinationInfo));
        assert_eq!(seen[1].0, "svc");
        assert!(matches!(seen[1].1, BusError::EndpointAlreadyRegistered(_)));

        let mut ids = bus.registry().listener_ids();
        ids.sort();
        assert_eq!(ids, vec!["svc".to_string(), "web".to_string()]);
        bus.stop(None).await;
    }

    #[tokio::test]
    async fn test_stop_covers_listeners_and_initiators() {
        let (bus, hub) = mem_bus();
        bus.serve(
            None,
            [
                silent(config("one", TransportKind::Mem, 7505)),
                silent(config("two", TransportKind::Mem, 7506)),
            ],
        )
        .await;
        let to_one = bus
            .dial(silent(config("c1", TransportKind::Mem, 7505)))
            .await
            .unwrap();
        let to_two = bus
            .dial(silent(config("c2", TransportKind::Mem, 7506)))
            .await
            .unwrap();

        let (callback, mut errors) = error_channel();
        bus.stop(Some(callback)).await;

        assert!(to_one.closed().await.is_terminal());
        assert!(to_two.closed().await.is_terminal());
        assert!(bus.registry().is_empty());
        assert!(!hub.is_listening(loopback(7505)));
        assert!(!hub.is_listening(loopback(7506)));
        assert!(errors.try_recv().is_err());
    }
}
