//! Cooperative timer facade
//!
//! All timers live in one run queue ordered by deadline and arming order.
//! Timers are tagged with a [`Purpose`]; arming a purpose that is already
//! pending replaces the previous timer. Jobs receive the owning context by
//! `&mut` when they fire instead of capturing it.

use log::debug;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Duration,
};
use tokio::time::Instant;

/// Smallest interval a periodic timer is re-armed with.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Logical role of a timer. At most one timer per purpose is pending.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Purpose {
    /// Client connect attempt did not succeed in time.
    ConnectTimeout,
    /// Switch the access point off once the client link is stable.
    ApShutdown,
    /// Periodic client reconnect while in access-point fallback.
    ClientRetry,
    /// Periodic message-bus reconnect.
    BusReconnect,
    /// Periodic message-bus status publish.
    BusStatus,
}

type Job<C> = Box<dyn FnMut(&mut C) + Send>;
type DeferredJob<C> = Box<dyn FnOnce(&mut C) + Send>;

enum Task<C> {
    Timer {
        purpose: Purpose,
        period: Option<Duration>,
        job: Job<C>,
    },
    Deferred(DeferredJob<C>),
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Slot {
    due: Instant,
    seq: u64,
}

/// A context that owns a [`Scheduler`] for itself.
pub trait Scheduled: Sized {
    fn scheduler(&mut self) -> &mut Scheduler<Self>;

    /// Run every job that is due now. Returns the number of jobs run.
    fn run_pending(&mut self) -> usize {
        crate::scheduler::run_pending(self)
    }
}

pub struct Scheduler<C> {
    queue: BTreeMap<Slot, Task<C>>,
    pending: HashMap<Purpose, Slot>,
    seq: u64,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queued", &self.queue.len())
            .field("pending", &self.pending)
            .finish()
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            pending: HashMap::new(),
            seq: 0,
        }
    }

    /// Arm a timer for `purpose`, replacing a pending one.
    ///
    /// With `repeat` set the job fires every `delay` until cancelled or
    /// replaced.
    pub fn after<F>(&mut self, purpose: Purpose, delay: Duration, repeat: bool, job: F)
    where
        F: FnMut(&mut C) + Send + 'static,
    {
        self.cancel(purpose);

        let slot = self.next_slot(Instant::now() + delay);
        let period = repeat.then(|| delay.max(MIN_PERIOD));

        debug!("scheduler: arm {purpose:?} in {delay:?} (repeat: {repeat})");

        self.queue.insert(
            slot,
            Task::Timer {
                purpose,
                period,
                job: Box::new(job),
            },
        );
        self.pending.insert(purpose, slot);
    }

    /// Arm a one-shot timer for `purpose`.
    pub fn once<F>(&mut self, purpose: Purpose, delay: Duration, job: F)
    where
        F: FnMut(&mut C) + Send + 'static,
    {
        self.after(purpose, delay, false, job)
    }

    /// Arm a periodic timer for `purpose`.
    pub fn every<F>(&mut self, purpose: Purpose, interval: Duration, job: F)
    where
        F: FnMut(&mut C) + Send + 'static,
    {
        self.after(purpose, interval, true, job)
    }

    /// Cancel the pending timer for `purpose`. Returns whether one was pending.
    pub fn cancel(&mut self, purpose: Purpose) -> bool {
        match self.pending.remove(&purpose) {
            Some(slot) => {
                self.queue.remove(&slot);
                debug!("scheduler: cancel {purpose:?}");
                true
            }
            None => false,
        }
    }

    /// Run `job` at the next scheduling opportunity, never synchronously.
    ///
    /// A deferred job runs before any timer armed after it with a nonzero
    /// delay.
    pub fn defer<F>(&mut self, job: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let slot = self.next_slot(Instant::now());
        self.queue.insert(slot, Task::Deferred(Box::new(job)));
    }

    pub fn is_pending(&self, purpose: Purpose) -> bool {
        self.pending.contains_key(&purpose)
    }

    /// Deadline of the earliest queued job.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first_key_value().map(|(slot, _)| slot.due)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every queued job.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
    }

    fn next_slot(&mut self, due: Instant) -> Slot {
        self.seq += 1;
        Slot { due, seq: self.seq }
    }

    fn pop_due(&mut self, now: Instant) -> Option<(Slot, Task<C>)> {
        let (slot, _) = self.queue.first_key_value()?;
        if slot.due > now {
            return None;
        }

        let (slot, task) = self.queue.pop_first()?;

        // periodic timers stay registered while their job runs, so a job can
        // cancel or replace its own purpose
        if let Task::Timer {
            purpose,
            period: None,
            ..
        } = &task
        {
            self.pending.remove(purpose);
        }

        Some((slot, task))
    }

    fn rearm(&mut self, purpose: Purpose, fired: Slot, now: Instant, period: Duration, job: Job<C>) {
        if self.pending.get(&purpose) != Some(&fired) {
            return;
        }

        let slot = self.next_slot(now + period);
        self.queue.insert(
            slot,
            Task::Timer {
                purpose,
                period: Some(period),
                job,
            },
        );
        self.pending.insert(purpose, slot);
    }
}

/// Run every job of `ctx`'s scheduler that is due now.
pub fn run_pending<C: Scheduled>(ctx: &mut C) -> usize {
    let now = Instant::now();
    let mut ran = 0;

    while let Some((slot, task)) = ctx.scheduler().pop_due(now) {
        ran += 1;

        match task {
            Task::Deferred(job) => job(ctx),
            Task::Timer {
                purpose,
                period: None,
                mut job,
            } => {
                debug!("scheduler: fire {purpose:?}");
                job(ctx)
            }
            Task::Timer {
                purpose,
                period: Some(period),
                mut job,
            } => {
                debug!("scheduler: fire {purpose:?}");
                job(ctx);
                ctx.scheduler().rearm(purpose, slot, now, period, job);
            }
        }
    }

    ran
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[derive(Default)]
    struct Ctx {
        scheduler: Scheduler<Ctx>,
        log: Vec<&'static str>,
    }

    impl Scheduled for Ctx {
        fn scheduler(&mut self) -> &mut Scheduler<Self> {
            &mut self.scheduler
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_a_purpose_keeps_only_the_latest_timer() {
        let mut ctx = Ctx::default();

        ctx.scheduler
            .once(Purpose::ConnectTimeout, Duration::from_secs(5), |c: &mut Ctx| {
                c.log.push("first")
            });
        ctx.scheduler
            .once(Purpose::ConnectTimeout, Duration::from_secs(5), |c: &mut Ctx| {
                c.log.push("second")
            });

        advance(Duration::from_secs(10)).await;
        assert_eq!(ctx.run_pending(), 1);
        assert_eq!(ctx.log, vec!["second"]);
        assert!(!ctx.scheduler.is_pending(Purpose::ConnectTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn timers_fire_only_when_due() {
        let mut ctx = Ctx::default();

        ctx.scheduler
            .once(Purpose::ApShutdown, Duration::from_secs(3), |c: &mut Ctx| {
                c.log.push("fired")
            });

        advance(Duration::from_secs(2)).await;
        assert_eq!(ctx.run_pending(), 0);

        advance(Duration::from_secs(1)).await;
        assert_eq!(ctx.run_pending(), 1);
        assert_eq!(ctx.log, vec!["fired"]);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_repeats_until_cancelled() {
        let mut ctx = Ctx::default();

        ctx.scheduler
            .every(Purpose::ClientRetry, Duration::from_secs(30), |c: &mut Ctx| {
                c.log.push("retry")
            });

        for _ in 0..3 {
            advance(Duration::from_secs(30)).await;
            ctx.run_pending();
        }
        assert_eq!(ctx.log.len(), 3);
        assert!(ctx.scheduler.is_pending(Purpose::ClientRetry));

        assert!(ctx.scheduler.cancel(Purpose::ClientRetry));
        advance(Duration::from_secs(30)).await;
        assert_eq!(ctx.run_pending(), 0);
        assert_eq!(ctx.log.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_job_can_cancel_itself() {
        let mut ctx = Ctx::default();

        ctx.scheduler
            .every(Purpose::BusReconnect, Duration::from_secs(15), |c: &mut Ctx| {
                c.log.push("tick");
                c.scheduler.cancel(Purpose::BusReconnect);
            });

        advance(Duration::from_secs(15)).await;
        ctx.run_pending();
        advance(Duration::from_secs(15)).await;
        ctx.run_pending();

        assert_eq!(ctx.log, vec!["tick"]);
        assert!(ctx.scheduler.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn defer_never_runs_synchronously_and_precedes_later_timers() {
        let mut ctx = Ctx::default();

        ctx.scheduler.defer(|c: &mut Ctx| c.log.push("deferred"));
        assert!(ctx.log.is_empty());

        ctx.scheduler
            .once(Purpose::BusStatus, Duration::from_millis(1), |c: &mut Ctx| {
                c.log.push("timer")
            });

        advance(Duration::from_millis(5)).await;
        ctx.run_pending();

        assert_eq!(ctx.log, vec!["deferred", "timer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_everything() {
        let mut ctx = Ctx::default();

        ctx.scheduler.every(Purpose::BusStatus, Duration::from_secs(1), |_: &mut Ctx| {});
        ctx.scheduler.defer(|_: &mut Ctx| {});
        ctx.scheduler.clear();

        assert!(ctx.scheduler.is_idle());
        assert_eq!(ctx.scheduler.next_deadline(), None);
    }
}
