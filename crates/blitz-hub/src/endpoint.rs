use crate::outbox::Outbox;
use crate::registry::{ClientRegistry, ConsumerId};
use crate::HubState;
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use blitz_core::CONNECTED_EVENT;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Unregisters the consumer when hyper drops the response body, whatever the
/// reason: client went away, write error, or the stream ended on shutdown.
struct ConsumerGuard {
    registry: Arc<ClientRegistry>,
    outbox: Arc<Outbox>,
    id: ConsumerId,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let dropped = self.outbox.dropped();
        if dropped > 0 {
            warn!(event = "outbox_overflow", consumer_id = self.id, dropped);
        }
        self.registry.unregister(self.id, "stream_closed");
    }
}

pub(crate) async fn subscribe(State(hub): State<Arc<HubState>>) -> Response {
    let outbox = Arc::new(Outbox::new(hub.config.outbox_capacity));
    let id = match hub.registry.register(outbox.clone()) {
        Ok(id) => id,
        Err(err) => {
            warn!(
                event = "subscribe_refused",
                consumers = hub.registry.len(),
                error = %err
            );
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };
    info!(event = "subscribe", consumer_id = id, consumers = hub.registry.len());
    hub.scheduler.refresh_all();

    let guard = ConsumerGuard {
        registry: Arc::clone(&hub.registry),
        outbox,
        id,
    };
    let connected = Event::default()
        .event(CONNECTED_EVENT)
        .json_data(serde_json::json!({ "consumer_id": id }));
    let messages = stream::unfold(
        (guard, hub.shutdown.clone()),
        |(guard, mut shutdown)| async move {
            let message = tokio::select! {
                message = guard.outbox.recv() => message?,
                _ = shutdown_requested(&mut shutdown) => return None,
            };
            let event = Event::default().json_data(&*message);
            Some((event, (guard, shutdown)))
        },
    );

    let keep_alive = KeepAlive::new()
        .interval(hub.config.keep_alive)
        .text("keep-alive");
    let mut response = Sse::new(stream::once(async move { connected }).chain(messages))
        .keep_alive(keep_alive)
        .into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            // Sender gone without a shutdown request: keep serving.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{router, test_state, HubConfig};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use blitz_core::{decode_feed_message, StreamEvent};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Splits complete `\n\n`-terminated blocks off `buffer` and decodes
    /// them. Comment-only blocks (keep-alives) yield nothing.
    fn drain_events(buffer: &mut String) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(end) = buffer.find("\n\n") {
            let block: String = buffer.drain(..end + 2).collect();
            let mut name = String::new();
            let mut data = Vec::new();
            for line in block.lines().filter(|line| !line.starts_with(':')) {
                let (field, value) = line.split_once(':').unwrap_or((line, ""));
                let value = value.strip_prefix(' ').unwrap_or(value);
                match field {
                    "event" => name = value.to_string(),
                    "data" => data.push(value),
                    _ => {}
                }
            }
            if name.is_empty() && data.is_empty() {
                continue;
            }
            events.push(decode_feed_message(&name, &data.join("\n")).expect("decode"));
        }
        events
    }

    fn subscribe_request() -> Request<Body> {
        Request::builder()
            .uri("/api/sse/subscribe")
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn stream_opens_with_connected_then_feed_messages() {
        let (hub, _shutdown) = test_state(HubConfig::default());
        let response = router(hub.clone())
            .oneshot(subscribe_request())
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(hub.registry.len(), 1);

        let mut body = response.into_body().into_data_stream();
        let mut buffer = String::new();
        let mut events = Vec::new();
        while events.len() < 3 {
            let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .expect("chunk in time")
                .expect("stream open")
                .expect("chunk");
            buffer.push_str(std::str::from_utf8(&chunk).expect("utf-8"));
            events.extend(drain_events(&mut buffer));
        }
        assert!(matches!(
            events[0],
            StreamEvent::Connected {
                consumer_id: Some(1)
            }
        ));
        assert!(events[1..]
            .iter()
            .all(|event| matches!(event, StreamEvent::Feed(message) if message.seq == Some(1))));

        drop(body);
        assert!(hub.registry.is_empty());
    }

    #[tokio::test]
    async fn refuses_subscribers_over_the_limit() {
        let config = HubConfig {
            max_consumers: 1,
            ..HubConfig::default()
        };
        let (hub, _shutdown) = test_state(config);
        let app = router(hub.clone());
        let first = app
            .clone()
            .oneshot(subscribe_request())
            .await
            .expect("first");
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(subscribe_request()).await.expect("second");
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hub.registry.len(), 1);

        drop(first);
        assert!(hub.registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_ends_open_streams() {
        let (hub, shutdown) = test_state(HubConfig::default());
        let response = router(hub.clone())
            .oneshot(subscribe_request())
            .await
            .expect("response");
        let mut body = response.into_body().into_data_stream();
        shutdown.send(true).expect("signal");

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = body.next().await {
                chunk.expect("chunk");
            }
        })
        .await;
        assert!(drained.is_ok());
        drop(body);
        assert!(hub.registry.is_empty());
    }
}
