use tokio_util::sync::CancellationToken;

/// Spawn a long-lived background loop tied to the process lifecycle.
///
/// The loops this runtime spawns (scheduler ticks, session GC) are expected
/// to run until the shutdown token fires. If one returns early or panics,
/// the process is degraded in a way no request will surface, so the
/// supervisor trips the shutdown token and lets the service wind down
/// loudly instead.
pub fn spawn_supervised<F>(
    name: &'static str,
    shutdown: CancellationToken,
    fut: F,
) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let inner = tokio::spawn(fut);
        let outcome = inner.await;
        if shutdown.is_cancelled() {
            tracing::debug!(task = name, "background loop stopped with shutdown");
            return;
        }

        match outcome {
            Ok(()) => tracing::error!(task = name, "background loop exited early"),
            Err(join_error) if join_error.is_panic() => {
                tracing::error!(task = name, "background loop panicked")
            }
            Err(join_error) => {
                tracing::error!(task = name, error = %join_error, "background loop join failed")
            }
        }
        shutdown.cancel();
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::spawn_supervised;

    #[tokio::test]
    async fn a_panicking_loop_trips_shutdown() {
        let shutdown = CancellationToken::new();
        let supervisor = spawn_supervised("boom_loop", shutdown.clone(), async move {
            panic!("boom");
        });

        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .expect("shutdown should trip");
        supervisor.await.expect("supervisor task join");
    }

    #[tokio::test]
    async fn an_early_exit_trips_shutdown() {
        let shutdown = CancellationToken::new();
        spawn_supervised("short_loop", shutdown.clone(), async {});

        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .expect("shutdown should trip");
    }

    #[tokio::test]
    async fn loops_that_stop_on_shutdown_are_clean() {
        let shutdown = CancellationToken::new();
        let loop_token = shutdown.clone();
        let supervisor = spawn_supervised("gc_loop", shutdown.clone(), async move {
            loop_token.cancelled().await;
        });

        shutdown.cancel();
        supervisor.await.expect("supervisor task join");
    }
}
