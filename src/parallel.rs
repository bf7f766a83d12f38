//! Fan-out helper shared by every concurrent phase.
//!
//! Helix never coordinates machines through anything fancier than "start one future per node,
//! wait for all of them, then look at what went wrong". [first_error] is that pattern, written
//! once.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tracing::debug;

/// Drives every future to completion concurrently and returns their outputs in input order.
///
/// Futures are never cancelled: a failure on one node does not interrupt work already in flight
/// on the others. Once everything has finished, the error that was *collected* first (i.e. the
/// first one to complete) wins and every later error is discarded after being logged at debug
/// level.
///
/// # Errors
///
/// Returns the first collected error, if any future failed.
pub async fn first_error<I, F, T>(futures: I) -> anyhow::Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = anyhow::Result<T>>,
{
    let mut pending: FuturesUnordered<_> = futures
        .into_iter()
        .enumerate()
        .map(|(index, future)| async move { (index, future.await) })
        .collect();

    let mut outputs = Vec::with_capacity(pending.len());
    let mut error = None;
    while let Some((index, result)) = pending.next().await {
        match result {
            Ok(output) => outputs.push((index, output)),
            Err(err) if error.is_none() => error = Some(err),
            Err(err) => debug!("discarding additional error: {err:#}"),
        }
    }

    if let Some(err) = error {
        return Err(err);
    }
    outputs.sort_by_key(|(index, _)| *index);
    Ok(outputs.into_iter().map(|(_, output)| output).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn preserves_input_order() {
        // Later inputs finish first.
        let futures = (0..5u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis(50 - i * 10)).await;
            Ok(i)
        });
        assert_eq!(vec![0, 1, 2, 3, 4], first_error(futures).await.unwrap());
    }

    #[tokio::test]
    async fn empty_input_is_ok() {
        let futures: Vec<std::future::Ready<anyhow::Result<()>>> = Vec::new();
        assert!(first_error(futures).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_everything_before_failing() {
        let finished = AtomicUsize::new(0);
        let futures = (0..4u64).map(|i| {
            let finished = &finished;
            async move {
                tokio::time::sleep(Duration::from_millis(i * 10)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    bail!("node {i} failed");
                }
                Ok(())
            }
        });

        let error = first_error(futures).await.unwrap_err();
        assert_eq!("node 0 failed", error.to_string());
        assert_eq!(4, finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn first_collected_error_wins() {
        let futures = (0..3u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis(30 - i * 10)).await;
            if i == 0 {
                Ok(())
            } else {
                bail!("node {i} failed")
            }
        });

        // Node 2 sleeps the least, so its error is collected first.
        let error = first_error(futures).await.unwrap_err();
        assert_eq!("node 2 failed", error.to_string());
    }
}
