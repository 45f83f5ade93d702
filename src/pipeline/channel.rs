//! Bounded handoff between the build stage and the test stage.

use thiserror::Error;
use tokio::sync::mpsc;

use super::BuiltArtifact;

/// The other side of the channel is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("artifact channel closed")]
pub struct ChannelClosed;

/// Producer half.
#[derive(Debug, Clone)]
pub struct ArtifactSender {
    tx: mpsc::Sender<BuiltArtifact>,
}

/// Consumer half.
#[derive(Debug)]
pub struct ArtifactReceiver {
    rx: mpsc::Receiver<BuiltArtifact>,
}

/// Channel holding at most `capacity` artifacts.
pub fn artifact_channel(capacity: usize) -> (ArtifactSender, ArtifactReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ArtifactSender { tx }, ArtifactReceiver { rx })
}

impl ArtifactSender {
    /// Wait for room, then enqueue.
    pub async fn put(&self, artifact: BuiltArtifact) -> Result<(), ChannelClosed> {
        tracing::info!(
            batch = artifact.batch_index,
            tag = artifact.tag().unwrap_or("-"),
            sentinel = artifact.is_sentinel(),
            "puts artifact"
        );
        self.tx.send(artifact).await.map_err(|_| ChannelClosed)
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

impl ArtifactReceiver {
    /// Wait for the next artifact; `None` once every sender is gone.
    pub async fn take(&mut self) -> Option<BuiltArtifact> {
        let artifact = self.rx.recv().await;
        log_take(artifact.as_ref());
        artifact
    }

    /// Blocking [`ArtifactReceiver::take`] for the test stage thread.
    pub fn take_blocking(&mut self) -> Option<BuiltArtifact> {
        let artifact = self.rx.blocking_recv();
        log_take(artifact.as_ref());
        artifact
    }
}

fn log_take(artifact: Option<&BuiltArtifact>) {
    if let Some(artifact) = artifact {
        tracing::info!(
            batch = artifact.batch_index,
            tag = artifact.tag().unwrap_or("-"),
            "takes artifact"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn artifact(i: usize) -> BuiltArtifact {
        BuiltArtifact::built(vec![format!("A.java@{i}..{}", i + 1)], i, vec!["8".into()], format!("{i}_8"))
    }

    #[tokio::test]
    async fn full_channel_blocks_until_one_is_taken() {
        let (tx, mut rx) = artifact_channel(2);
        tx.put(artifact(0)).await.expect("room for first");
        tx.put(artifact(1)).await.expect("room for second");
        assert_eq!(tx.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.put(artifact(2))).await;
        assert!(blocked.is_err(), "third put should wait for the consumer");

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.put(artifact(2)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(rx.take().await.map(|a| a.batch_index), Some(0));
        producer
            .await
            .expect("producer task should join")
            .expect("third put should succeed once space frees");
        assert_eq!(tx.available(), 0);

        assert_eq!(rx.take().await.map(|a| a.batch_index), Some(1));
        assert_eq!(rx.take().await.map(|a| a.batch_index), Some(2));
    }

    #[tokio::test]
    async fn closed_channels_are_reported() {
        let (tx, rx) = artifact_channel(1);
        drop(rx);
        assert_eq!(tx.put(artifact(0)).await, Err(ChannelClosed));

        let (tx, mut rx) = artifact_channel(1);
        drop(tx);
        assert!(rx.take().await.is_none());
    }

    #[test]
    fn blocking_take_receives_sentinel() {
        let (tx, mut rx) = artifact_channel(2);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime should build");
        runtime
            .block_on(tx.put(BuiltArtifact::sentinel(4)))
            .expect("sentinel put");
        let taken = rx.take_blocking().expect("sentinel should arrive");
        assert!(taken.is_sentinel());
        assert_eq!(taken.batch_index, 4);
    }
}
