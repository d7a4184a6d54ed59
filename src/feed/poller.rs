use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entity::Entity;
use crate::runtime::engine::TaskEngine;
use crate::runtime::invocation::entity_tag;
use crate::runtime::task::{TaskBuilder, TaskId};
use crate::feed::source::{PollConfig, PollResult};

pub const FEED_POLL_TAG: &str = "FEED_POLL";

pub fn feed_tag(unique_tag: &str) -> String {
    format!("feed:{}", unique_tag)
}

/// State shared by a feed and the poll loops it spawns.
pub(crate) struct FeedCore {
    pub unique_tag: String,
    pub entity: Weak<Entity>,
    pub entity_id: String,
    pub tasks: TaskEngine,
    pub period: Duration,
    pub polls: Vec<PollConfig>,
    pub poll_history: usize,
    pub health: PollHealth,
}

/// Tracks which polls are currently failing, so that only the first failure
/// after success is logged loudly and recovery is reported once.
#[derive(Default)]
pub(crate) struct PollHealth {
    failing: Mutex<BTreeMap<usize, String>>,
}

impl PollHealth {
    fn failure(&self, core: &FeedCore, entity: &Entity, index: usize, connected: bool, message: String) {
        let (first, problem) = {
            let Ok(mut failing) = self.failing.lock() else {
                return;
            };
            let first = failing.insert(index, message.clone()).is_none();
            (first, summarize(&failing))
        };
        let sensor = core.polls[index].sensor.as_str();
        if first && connected {
            warn!(entity_id = %entity.id(), feed = %core.unique_tag, sensor, error = %message, "Poll failed");
        } else {
            debug!(entity_id = %entity.id(), feed = %core.unique_tag, sensor, error = %message, "Poll failed");
        }
        entity.update_problem(&core.unique_tag, problem);
    }

    fn success(&self, core: &FeedCore, entity: &Entity, index: usize) {
        let (recovered, problem) = {
            let Ok(mut failing) = self.failing.lock() else {
                return;
            };
            let recovered = failing.remove(&index).is_some();
            (recovered, summarize(&failing))
        };
        if recovered {
            info!(
                entity_id = %entity.id(),
                feed = %core.unique_tag,
                sensor = %core.polls[index].sensor,
                "Poll recovered"
            );
            entity.update_problem(&core.unique_tag, problem);
        }
    }

    pub(crate) fn is_failing(&self) -> bool {
        self.failing.lock().map(|f| !f.is_empty()).unwrap_or(false)
    }
}

fn summarize(failing: &BTreeMap<usize, String>) -> Option<String> {
    if failing.is_empty() {
        None
    } else {
        Some(failing.values().cloned().collect::<Vec<_>>().join("; "))
    }
}

/// 轮询器：每个 poll 一个 tokio 循环
pub struct Poller {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Poller {
    pub(crate) fn start(core: Arc<FeedCore>) -> Self {
        let token = CancellationToken::new();
        let handles = (0..core.polls.len())
            .map(|index| {
                let core = core.clone();
                let token = token.clone();
                tokio::spawn(async move { poll_loop(core, index, token).await })
            })
            .collect();
        debug!(feed = %core.unique_tag, entity_id = %core.entity_id, "Poller started");
        Self { token, handles }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub(crate) fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn poll_loop(core: Arc<FeedCore>, index: usize, token: CancellationToken) {
    let poll = &core.polls[index];
    let mut ticker = tokio::time::interval(poll.period.unwrap_or(core.period));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_published: Option<Value> = None;
    let mut history: VecDeque<TaskId> = VecDeque::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(entity) = core.entity.upgrade() else {
            break;
        };

        let source = poll.source.clone();
        let builder = TaskBuilder::new(format!("Poll {} for {}", poll.sensor, core.unique_tag))
            .tag(FEED_POLL_TAG)
            .tag(feed_tag(&core.unique_tag))
            .tag(entity_tag(entity.id()))
            .timeout_opt(poll.timeout)
            .body(move |_| async move {
                Ok(match source.sample().await? {
                    PollResult::Success(v) => json!({ "success": true, "value": v }),
                    PollResult::Failure(v) => json!({ "success": false, "value": v }),
                })
            });

        let outcome = match core.tasks.submit_new(builder).await {
            Ok(handle) => {
                history.push_back(handle.id());
                tokio::select! {
                    _ = token.cancelled() => break,
                    r = handle.get() => r,
                }
            }
            Err(e) => Err(e),
        };
        // a suspended or stopped feed never publishes
        if token.is_cancelled() {
            break;
        }

        let connected = entity.is_managed();
        let publish = |value: Value, last: &mut Option<Value>| {
            if poll.suppress_duplicates && last.as_ref() == Some(&value) {
                return;
            }
            entity.set_sensor(&poll.sensor, value.clone());
            *last = Some(value);
        };

        match outcome {
            Ok(sample) if sample["success"] == Value::Bool(true) => {
                match poll.on_success.apply(sample["value"].clone()) {
                    Ok(mapped) => {
                        publish(mapped, &mut last_published);
                        core.health.success(&core, &entity, index);
                    }
                    Err(e) => {
                        if let Some(v) = &poll.on_exception {
                            publish(v.clone(), &mut last_published);
                        }
                        core.health
                            .failure(&core, &entity, index, connected, e.user_message());
                    }
                }
            }
            Ok(sample) => {
                if let Some(v) = &poll.on_failure {
                    publish(v.clone(), &mut last_published);
                }
                let message = format!("Poll of {} reported failure: {}", poll.sensor, sample["value"]);
                core.health.failure(&core, &entity, index, connected, message);
            }
            Err(e) => {
                if let Some(v) = &poll.on_exception {
                    publish(v.clone(), &mut last_published);
                }
                core.health
                    .failure(&core, &entity, index, connected, e.user_message());
            }
        }

        while history.len() > core.poll_history {
            if let Some(old) = history.pop_front() {
                core.tasks.store().remove_tree(old);
            }
        }
    }
    debug!(feed = %core.unique_tag, sensor = %poll.sensor, "Poll loop ended");
}
