use std::str::FromStr as _;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Local};
use cron::Schedule;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

/// Work started on every tick of a schedule.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub trait Scheduler {
    /// Runs `job` on every time matched by the cron `expression`.
    fn schedule(&mut self, expression: &str, job: Job) -> anyhow::Result<()>;
}

/// Cron scheduler backed by tokio tasks, one per registration.
#[derive(Default)]
pub struct CronScheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        CronScheduler::default()
    }
}

/// Accepts classic five-field expressions by prepending a zero seconds field.
fn parse_expression(expression: &str) -> anyhow::Result<Schedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).with_context(|| format!("invalid cron expression {:?}", expression))
}

/// Next tick strictly after both the last fired tick and `now`.
///
/// Waking slightly early on the wall clock must not hand back the tick that just fired.
fn next_run(
    schedule: &Schedule,
    last_fired: Option<DateTime<Local>>,
    now: DateTime<Local>,
) -> Option<DateTime<Local>> {
    let from = match last_fired {
        Some(last) if last > now => last,
        _ => now,
    };
    schedule.after(&from).next()
}

impl Scheduler for CronScheduler {
    fn schedule(&mut self, expression: &str, job: Job) -> anyhow::Result<()> {
        let schedule = parse_expression(expression)?;
        let expression = expression.to_string();

        self.tasks.push(tokio::spawn(async move {
            let mut last_fired = None;
            loop {
                let Some(next) = next_run(&schedule, last_fired, Local::now()) else {
                    warn!("Schedule {:?} has no upcoming runs", expression);
                    break;
                };
                debug!("Next run of {:?} at {}", expression, next);

                let wait = (next - Local::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                last_fired = Some(next);
                info!("Scheduled run of {:?} firing", expression);
                // runs are not awaited, so a slow one can overlap the next tick
                tokio::spawn(job());
            }
        }));
        Ok(())
    }
}
