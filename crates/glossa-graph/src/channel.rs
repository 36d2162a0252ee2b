//! Token handoff between a streaming provider call and the run's consumer
//!
//! One producer, one consumer, capacity 1: the producer waits until the
//! previous event has been taken. The channel ends exactly once, either with
//! the end marker or an abnormal-end marker; a producer that disappears
//! without sending either is reported to the consumer as an error. The end
//! marker is acknowledged, so a finished producer knows the consumer saw it.

use glossa_ai::Provider;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// One incremental generation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEvent {
    pub delta_text: String,
    pub cumulative_text: String,
    pub provider: Provider,
    pub model: String,
}

#[derive(Debug)]
enum Signal {
    Token(TokenEvent),
    End(oneshot::Sender<()>),
    Failed(String),
}

/// Create a connected sender/receiver pair for one run
pub fn token_channel(cancel: CancellationToken) -> (TokenSender, TokenReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        TokenSender { tx, cancel },
        TokenReceiver {
            rx,
            finished: false,
        },
    )
}

/// Producing half, held by the node running the streaming call
#[derive(Debug)]
pub struct TokenSender {
    tx: mpsc::Sender<Signal>,
    cancel: CancellationToken,
}

impl TokenSender {
    async fn deliver(&self, signal: Signal) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::StreamClosed),
            sent = self.tx.send(signal) => sent.map_err(|_| Error::StreamClosed),
        }
    }

    /// Hand one event to the consumer, waiting while the previous one is undrained
    pub async fn send(&self, event: TokenEvent) -> Result<()> {
        self.deliver(Signal::Token(event)).await
    }

    /// Close the channel with the end-of-generation marker and wait until
    /// the consumer has taken it
    pub async fn finish(self) -> Result<()> {
        let (ack, taken) = oneshot::channel();
        self.deliver(Signal::End(ack)).await?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::StreamClosed),
            taken = taken => taken.map_err(|_| Error::StreamClosed),
        }
    }

    /// Close the channel with an abnormal end
    pub async fn fail(self, message: impl Into<String>) {
        // The consumer may already be gone; nothing left to tell it then.
        let _ = self.deliver(Signal::Failed(message.into())).await;
    }
}

/// Consuming half, held by whoever observes the run
#[derive(Debug)]
pub struct TokenReceiver {
    rx: mpsc::Receiver<Signal>,
    finished: bool,
}

impl TokenReceiver {
    /// Next delta, `None` after the end marker, `Err` on any abnormal end
    pub async fn next_event(&mut self) -> Result<Option<TokenEvent>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Signal::Token(event)) => Ok(Some(event)),
            Some(Signal::End(ack)) => {
                let _ = ack.send(());
                self.finished = true;
                Ok(None)
            }
            Some(Signal::Failed(message)) => {
                self.finished = true;
                Err(Error::Aborted(message))
            }
            None => {
                self.finished = true;
                Err(Error::Aborted(
                    "token channel closed without end marker".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(delta: &str, cumulative: &str) -> TokenEvent {
        TokenEvent {
            delta_text: delta.into(),
            cumulative_text: cumulative.into(),
            provider: Provider::Local,
            model: "llama3.1".into(),
        }
    }

    #[tokio::test]
    async fn test_fifo_then_end_marker() {
        let (tx, mut rx) = token_channel(CancellationToken::new());
        let producer = tokio::spawn(async move {
            tx.send(event("a", "a")).await?;
            tx.send(event("b", "ab")).await?;
            tx.send(event("c", "abc")).await?;
            tx.finish().await
        });

        let mut deltas = Vec::new();
        while let Some(e) = rx.next_event().await.unwrap() {
            deltas.push(e.delta_text);
        }
        assert_eq!(deltas, vec!["a", "b", "c"]);
        assert!(rx.next_event().await.unwrap().is_none());
        producer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_backpressure_blocks_until_drained() {
        let (tx, mut rx) = token_channel(CancellationToken::new());
        tx.send(event("a", "a")).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(20), tx.send(event("b", "ab"))).await;
        assert!(blocked.is_err(), "second send should wait for the consumer");

        assert_eq!(rx.next_event().await.unwrap().unwrap().delta_text, "a");
        tokio::time::timeout(Duration::from_millis(200), tx.send(event("b", "ab")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.next_event().await.unwrap().unwrap().delta_text, "b");
    }

    #[tokio::test]
    async fn test_finish_waits_for_consumer() {
        let (tx, mut rx) = token_channel(CancellationToken::new());
        let finishing = tokio::spawn(tx.finish());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!finishing.is_finished(), "finish returned before the marker was taken");

        assert!(rx.next_event().await.unwrap().is_none());
        finishing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_finish_fails_when_marker_never_taken() {
        let (tx, rx) = token_channel(CancellationToken::new());
        let finishing = tokio::spawn(tx.finish());

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);
        assert!(matches!(finishing.await.unwrap(), Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn test_finish_fails_on_cancel() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = token_channel(cancel.clone());
        let finishing = tokio::spawn(tx.finish());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(finishing.await.unwrap(), Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn test_close_without_marker_is_error() {
        let (tx, mut rx) = token_channel(CancellationToken::new());
        tx.send(event("a", "a")).await.unwrap();
        drop(tx);

        assert!(rx.next_event().await.unwrap().is_some());
        assert!(matches!(rx.next_event().await, Err(Error::Aborted(_))));
    }

    #[tokio::test]
    async fn test_fail_carries_message() {
        let (tx, mut rx) = token_channel(CancellationToken::new());
        tx.fail("backend exploded").await;
        match rx.next_event().await {
            Err(Error::Aborted(message)) => assert_eq!(message, "backend exploded"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_cancel_fails() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = token_channel(cancel.clone());
        cancel.cancel();
        assert!(matches!(
            tx.send(event("a", "a")).await,
            Err(Error::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_fails() {
        let (tx, rx) = token_channel(CancellationToken::new());
        drop(rx);
        assert!(matches!(
            tx.send(event("a", "a")).await,
            Err(Error::StreamClosed)
        ));
    }
}
