pub mod http;
pub mod poller;
pub mod source;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::{debug, info};

use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::management::ManagementContext;
use crate::feed::poller::{FeedCore, PollHealth, Poller};
use crate::feed::source::{FeedSpec, PollConfig};

pub use http::HttpPoll;
pub use poller::{FEED_POLL_TAG, feed_tag};
pub use source::{CommandPoll, PollResult, PollSource, ValueMapping};

pub type FeedHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct FeedState {
    activated: bool,
    suspended: bool,
    destroyed: bool,
    poller: Option<Poller>,
}

/// A consistent view of a feed's flags, taken under its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub activated: bool,
    pub suspended: bool,
    pub destroyed: bool,
    pub poller_running: bool,
}

/// 传感器 feed：附着在实体上的后台采样器
///
/// All lifecycle transitions happen under one mutex, so concurrent
/// `suspend`/`resume` calls serialize and the poller is never running
/// while the feed reports itself suspended.
pub struct Feed {
    core: Arc<FeedCore>,
    state: Mutex<FeedState>,
    pre_stop: Option<FeedHook>,
    post_stop: Option<FeedHook>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("unique_tag", &self.core.unique_tag)
            .field("entity_id", &self.core.entity_id)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl Feed {
    pub fn builder(mgmt: &ManagementContext, entity: &Arc<Entity>) -> FeedBuilder {
        FeedBuilder {
            mgmt: mgmt.clone(),
            entity: Arc::downgrade(entity),
            entity_id: entity.id().to_string(),
            unique_tag: None,
            period: mgmt.config().default_poll_period(),
            polls: Vec::new(),
            pre_stop: None,
            post_stop: None,
            suspended: false,
        }
    }

    pub fn unique_tag(&self) -> &str {
        &self.core.unique_tag
    }

    pub fn entity_id(&self) -> &str {
        &self.core.entity_id
    }

    pub fn period(&self) -> Duration {
        self.core.period
    }

    pub fn polls(&self) -> &[PollConfig] {
        &self.core.polls
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        // a panicked hook must not wedge the feed forever
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns the poller (unless created suspended). Fails if already
    /// activated or if a poller somehow still exists.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(EngineError::IllegalState(format!(
                "Feed {} has been destroyed",
                self.core.unique_tag
            )));
        }
        if state.activated || state.poller.is_some() {
            return Err(EngineError::IllegalState(format!(
                "Feed {} is already activated",
                self.core.unique_tag
            )));
        }
        state.activated = true;
        if !state.suspended {
            state.poller = Some(Poller::start(self.core.clone()));
        }
        info!(feed = %self.core.unique_tag, entity_id = %self.core.entity_id, suspended = state.suspended, "Feed started");
        Ok(())
    }

    /// Idempotent; stops the poller and keeps the feed activated.
    pub fn suspend(&self) {
        let mut state = self.lock();
        if state.suspended {
            return;
        }
        state.suspended = true;
        if let Some(poller) = state.poller.take() {
            poller.stop();
        }
        debug!(feed = %self.core.unique_tag, "Feed suspended");
    }

    /// Idempotent; restarts the poller only if the feed is activated.
    pub fn resume(&self) {
        let mut state = self.lock();
        if !state.suspended {
            return;
        }
        state.suspended = false;
        if state.activated && !state.destroyed && state.poller.is_none() {
            state.poller = Some(Poller::start(self.core.clone()));
        }
        debug!(feed = %self.core.unique_tag, "Feed resumed");
    }

    /// No-op when not activated. Otherwise marks the feed inactive, runs
    /// `pre_stop`, halts the poller, then runs `post_stop`. Only the caller
    /// that flips `activated` runs the hooks.
    pub fn stop(&self) {
        let poller = {
            let mut state = self.lock();
            if !state.activated {
                debug!(feed = %self.core.unique_tag, "Stop called on feed that is not activated; ignoring");
                return;
            }
            state.activated = false;
            state.poller.take()
        };
        if let Some(hook) = &self.pre_stop {
            hook();
        }
        if let Some(poller) = poller {
            poller.stop();
        }
        if let Some(hook) = &self.post_stop {
            hook();
        }
        info!(feed = %self.core.unique_tag, entity_id = %self.core.entity_id, "Feed stopped");
    }

    /// Stops, then releases the feed's diagnostics. A destroyed feed cannot restart.
    pub fn destroy(&self) {
        self.stop();
        {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        if let Some(entity) = self.core.entity.upgrade() {
            entity.update_problem(&self.core.unique_tag, None);
        }
        debug!(feed = %self.core.unique_tag, "Feed destroyed");
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        let state = self.lock();
        FeedSnapshot {
            activated: state.activated,
            suspended: state.suspended,
            destroyed: state.destroyed,
            poller_running: state.poller.as_ref().is_some_and(|p| p.is_running()),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.lock().activated
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn is_running(&self) -> bool {
        let s = self.snapshot();
        s.activated && !s.suspended && s.poller_running
    }

    /// Running, and the owning entity is still managed.
    pub fn is_connected(&self) -> bool {
        self.is_running()
            && self
                .core
                .entity
                .upgrade()
                .is_some_and(|e| e.is_managed())
    }

    pub fn has_problem(&self) -> bool {
        self.core.health.is_failing()
    }

    pub fn to_spec(&self) -> FeedSpec {
        let state = self.snapshot();
        FeedSpec {
            unique_tag: self.core.unique_tag.clone(),
            entity_id: self.core.entity_id.clone(),
            period_ms: self.core.period.as_millis() as u64,
            polls: self.core.polls.iter().map(PollConfig::to_spec).collect(),
            suspended: state.suspended,
            activated: state.activated,
        }
    }
}

pub struct FeedBuilder {
    mgmt: ManagementContext,
    entity: Weak<Entity>,
    entity_id: String,
    unique_tag: Option<String>,
    period: Duration,
    polls: Vec<PollConfig>,
    pre_stop: Option<FeedHook>,
    post_stop: Option<FeedHook>,
    suspended: bool,
}

impl FeedBuilder {
    pub fn unique_tag(mut self, tag: impl Into<String>) -> Self {
        self.unique_tag = Some(tag.into());
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn poll(mut self, poll: PollConfig) -> Self {
        self.polls.push(poll);
        self
    }

    pub fn pre_stop(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.pre_stop = Some(Arc::new(hook));
        self
    }

    pub fn post_stop(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.post_stop = Some(Arc::new(hook));
        self
    }

    /// Created suspended: `start` activates it without polling.
    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    /// Deterministic tag from the polls, e.g. `FunctionFeed[cpu:load,mem:free]`,
    /// so an equivalent feed re-created after restart replaces rather than duplicates.
    fn default_tag(&self) -> String {
        let kind = match self.polls.first().map(|p| p.source.kind()) {
            Some(k) if self.polls.iter().all(|p| p.source.kind() == k) => k,
            _ => "Feed",
        };
        let parts: Vec<String> = self
            .polls
            .iter()
            .map(|p| format!("{}:{}", p.source.describe(), p.sensor))
            .collect();
        format!("{}[{}]", kind, parts.join(","))
    }

    pub fn build(self) -> Result<Arc<Feed>> {
        if self.polls.is_empty() {
            return Err(EngineError::IllegalArgument(
                "A feed needs at least one poll".to_string(),
            ));
        }
        if self.period.is_zero() || self.polls.iter().any(|p| p.period.is_some_and(|d| d.is_zero())) {
            return Err(EngineError::IllegalArgument(
                "Feed poll period must be positive".to_string(),
            ));
        }
        let unique_tag = self.unique_tag.clone().unwrap_or_else(|| self.default_tag());
        let core = FeedCore {
            unique_tag,
            entity: self.entity,
            entity_id: self.entity_id,
            tasks: self.mgmt.tasks().clone(),
            period: self.period,
            polls: self.polls,
            poll_history: self.mgmt.config().feeds.poll_history,
            health: PollHealth::default(),
        };
        Ok(Arc::new(Feed {
            core: Arc::new(core),
            state: Mutex::new(FeedState {
                suspended: self.suspended,
                ..Default::default()
            }),
            pre_stop: self.pre_stop,
            post_stop: self.post_stop,
        }))
    }

    /// Builds and attaches to the entity, replacing any feed with the same tag.
    pub fn attach(self) -> Result<Arc<Feed>> {
        let entity = self.entity.upgrade().ok_or_else(|| {
            EngineError::IllegalState(format!("Entity {} no longer exists", self.entity_id))
        })?;
        let feed = self.build()?;
        entity.add_feed(feed)
    }
}
