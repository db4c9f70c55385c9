use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Awaits every worker under `timeout`. Past the deadline the token is
/// cancelled so workers can close their sessions; whatever is still running
/// after `grace` is aborted. Returns whether the deadline was hit.
pub(crate) async fn await_workers<T: 'static>(
    workers: &mut JoinSet<T>,
    cancel: &CancellationToken,
    timeout: Duration,
    grace: Duration,
    mut on_finished: impl FnMut(T),
) -> bool {
    let within_deadline = tokio::time::timeout(timeout, drain(workers, &mut on_finished)).await;
    if within_deadline.is_ok() {
        return false;
    }

    warn!(?timeout, remaining = workers.len(), "run exceeded its deadline; cancelling workers");
    cancel.cancel();
    if tokio::time::timeout(grace, drain(workers, &mut on_finished))
        .await
        .is_err()
    {
        warn!(remaining = workers.len(), "workers ignored cancellation; aborting");
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }
    true
}

async fn drain<T: 'static>(workers: &mut JoinSet<T>, on_finished: &mut impl FnMut(T)) {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(result) => on_finished(result),
            Err(err) if err.is_cancelled() => {}
            Err(err) => error!(error = %err, "worker task panicked"),
        }
    }
}

/// Splits `items` into one contiguous share per worker; the last share takes
/// the remainder. Empty shares are dropped.
pub(crate) fn split_evenly<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1);
    let total = items.len();
    let share = (total / workers).max(1);
    let mut iter = items.into_iter();
    let mut shares = Vec::with_capacity(workers);
    for index in 0..workers {
        let take = if index + 1 == workers { total } else { share };
        let chunk: Vec<T> = iter.by_ref().take(take).collect();
        if !chunk.is_empty() {
            shares.push(chunk);
        }
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split_gives_remainder_to_last_worker() {
        let shares = split_evenly((0..17).collect(), 8);
        let sizes: Vec<_> = shares.iter().map(Vec::len).collect();
        assert_eq!(sizes, [2, 2, 2, 2, 2, 2, 2, 3]);
        assert_eq!(shares.concat(), (0..17).collect::<Vec<_>>());
    }

    #[test]
    fn fewer_items_than_workers_spreads_one_each() {
        let shares = split_evenly(vec!["a", "b", "c"], 8);
        assert_eq!(shares, [vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_workers_are_cancelled_then_aborted() {
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();

        let polite = cancel.clone();
        workers.spawn(async move {
            polite.cancelled().await;
            "closed"
        });
        workers.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            "stuck"
        });
        workers.spawn(async { "quick" });

        let mut finished = Vec::new();
        let timed_out = await_workers(
            &mut workers,
            &cancel,
            Duration::from_secs(60),
            Duration::from_secs(5),
            |name| finished.push(name),
        )
        .await;

        assert!(timed_out);
        finished.sort();
        assert_eq!(finished, ["closed", "quick"]);
        assert!(workers.is_empty());
    }
}
