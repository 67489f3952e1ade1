use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How often to probe and for how long in total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub timeout: Duration,
}

pub enum Probe<T> {
    Ready(T),
    Pending,
}

#[derive(Debug)]
pub enum PollError<E> {
    TimedOut(Duration),
    Cancelled,
    Failed(E),
}

/// Probes until it reports `Ready`, fails, the deadline passes or `cancel` fires.
///
/// The deadline is absolute: slow probes eat into it, and the wait before the next probe
/// is clipped so the call never outlives `schedule.timeout` by more than one probe.
/// A probe already in flight when `cancel` fires completes first.
pub async fn poll_until<T, E, F, Fut>(
    schedule: PollSchedule,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let deadline = after(Instant::now(), schedule.timeout);
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        attempt += 1;
        match probe(attempt).await {
            Ok(Probe::Ready(v)) => return Ok(v),
            Ok(Probe::Pending) => {}
            Err(e) => return Err(PollError::Failed(e)),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut(schedule.timeout));
        }
        let wake = after(now, schedule.interval).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
        if Instant::now() >= deadline {
            return Err(PollError::TimedOut(schedule.timeout));
        }
    }
}

/// Roughly thirty years; stands in for budgets too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn after(now: Instant, d: Duration) -> Instant {
    now.checked_add(d).unwrap_or(now + FAR_FUTURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(interval: u64, timeout: u64) -> PollSchedule {
        PollSchedule {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_third_probe() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let res: Result<u32, PollError<()>> = poll_until(schedule(10, 600), &cancel, |n| async move {
            Ok(if n == 3 { Probe::Ready(n) } else { Probe::Pending })
        })
        .await;
        assert_eq!(res.unwrap(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let mut probes = 0;
        let res: Result<(), PollError<()>> = poll_until(schedule(10, 25), &cancel, |_| {
            probes += 1;
            async { Ok(Probe::Pending) }
        })
        .await;
        assert!(matches!(res, Err(PollError::TimedOut(d)) if d == Duration::from_secs(25)));
        assert_eq!(start.elapsed(), Duration::from_secs(25));
        assert_eq!(probes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_budget_does_not_overflow() {
        let cancel = CancellationToken::new();
        let huge = PollSchedule {
            interval: Duration::from_secs(10),
            timeout: Duration::MAX,
        };
        let res: Result<u32, PollError<()>> = poll_until(huge, &cancel, |n| async move {
            Ok(if n == 2 { Probe::Ready(n) } else { Probe::Pending })
        })
        .await;
        assert_eq!(res.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_error_is_returned() {
        let cancel = CancellationToken::new();
        let res: Result<(), PollError<&str>> =
            poll_until(schedule(1, 10), &cancel, |_| async { Err("boom") }).await;
        assert!(matches!(res, Err(PollError::Failed("boom"))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_waiting() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        let res: Result<(), PollError<()>> =
            poll_until(schedule(10, 600), &cancel, |_| async { Ok(Probe::Pending) }).await;
        assert!(matches!(res, Err(PollError::Cancelled)));
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }
}
