use std::time::Duration;

use super::{Connect, Connecting};
use crate::error::Error;

/// Decorator bounding the total time of a connection attempt.
///
/// One timer is armed when `connect` is called. If the underlying future
/// finishes first the timer is cancelled and the result forwarded; if the
/// timer fires first the underlying attempt is cancelled (dropped, releasing
/// its sockets, queries and handshakes) and a `Timeout` error is returned.
pub struct TimeoutConnector<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TimeoutConnector<C> {
    /// Wraps `inner` with the given timeout. The composing facade treats a
    /// non-positive timeout as "no timeout" and skips this decorator
    /// entirely; a zero `timeout` here elapses immediately.
    pub fn new(inner: C, timeout: Duration) -> TimeoutConnector<C> {
        TimeoutConnector { inner, timeout }
    }
}

impl<C> Connect for TimeoutConnector<C>
where
    C: Connect + Clone + 'static,
{
    fn connect(&self, target: &str) -> Connecting {
        let inner = self.inner.clone();
        let timeout = self.timeout;
        let target = target.to_owned();
        Box::pin(async move {
            match tokio::time::timeout(timeout, inner.connect(&target)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(Error::timeout(&target, timeout.as_secs_f64())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Connection;
    use crate::error::Result;
    use std::sync::Arc;

    /// A connector that never completes.
    #[derive(Clone)]
    struct Hanging;

    impl Connect for Hanging {
        fn connect(&self, _target: &str) -> Connecting {
            Box::pin(std::future::pending::<Result<Connection>>())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_after_the_configured_timeout() {
        let connector = TimeoutConnector::new(Arc::new(Hanging), Duration::from_secs(1));

        let start = tokio::time::Instant::now();
        let err = connector
            .connect("tcp://example.com:80")
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout());
        assert!(
            err.to_string()
                .contains("timed out after 1.00 seconds"),
            "{}",
            err
        );
        assert_eq!(err.target(), Some("tcp://example.com:80"));
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_results_cancel_the_timer() {
        #[derive(Clone)]
        struct Failing;
        impl Connect for Failing {
            fn connect(&self, target: &str) -> Connecting {
                let target = target.to_owned();
                Box::pin(async move {
                    Err(Error::connect(
                        &target,
                        std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                    ))
                })
            }
        }

        let connector = TimeoutConnector::new(Failing, Duration::from_secs(1));
        let start = tokio::time::Instant::now();
        let err = connector
            .connect("tcp://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(!err.is_timeout());
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
