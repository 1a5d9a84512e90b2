//! In-process request bus between the presenter (or CLI) and the coordinator.
//!
//! Every request travels with a oneshot reply channel, so callers await the
//! answer to exactly their own request.

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{Request, Response};

/// A request plus the channel its response goes back on.
pub struct Envelope {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Sending half of the bus.
#[derive(Clone)]
pub struct BusClient {
    tx: mpsc::Sender<Envelope>,
}

impl BusClient {
    pub async fn send(&self, request: Request) -> Result<Response> {
        let action = request.action();
        let (reply, response) = oneshot::channel();

        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| anyhow!("Coordinator is not running"))?;

        response
            .await
            .with_context(|| format!("Coordinator dropped the {} request", action))
    }
}

/// Create a bus with room for `capacity` queued requests.
pub fn channel(capacity: usize) -> (BusClient, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (BusClient { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_through_bus() {
        let (client, mut rx) = channel(4);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let _ = envelope.reply.send(Response::ok().with_message(envelope.request.action()));
            }
        });

        let response = client.send(Request::Ping).await.unwrap();
        assert_eq!(response.message.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn test_send_fails_when_coordinator_is_gone() {
        let (client, rx) = channel(1);
        drop(rx);

        let err = tokio_test::assert_err!(client.send(Request::GetTradingState).await);
        assert!(err.to_string().contains("not running"));
    }
}
