//! Optimistic, rollback-capable writes against the data service.

use crate::backend::IdeaStore;
use crate::cooldown::ActionGuard;
use crate::errors::{AppResult, Notice, Notifier};
use crate::event_bus::{DashboardEvent, EventBus, FavoriteUpdated, IdeaDeleted, TagsUpdated};
use crate::models::{ActionKind, Analysis, Idea, Tag};
use crate::pipeline::{AnalysisKind, AnalysisPipeline};
use crate::sync::ViewHandle;
use std::sync::Arc;

/// A single logical write expressed as a command object.
///
/// `apply` runs before the network call, `commit` performs the remote write and
/// yields the event to broadcast, and `rollback` undoes whatever `apply` did.
#[async_trait::async_trait]
pub trait Mutation: Send + Sync {
    fn idea_id(&self) -> &str;

    fn action(&self) -> ActionKind;

    /// Text for the blocking confirm gate, if this mutation needs one.
    fn confirmation_prompt(&self, _view: &ViewHandle) -> Option<String> {
        None
    }

    fn apply(&mut self, view: &ViewHandle);

    async fn commit(&mut self, owner_id: &str, store: &dyn IdeaStore) -> AppResult<DashboardEvent>;

    fn rollback(&mut self, view: &ViewHandle);
}

#[derive(Debug, Clone)]
pub struct SetFavorite {
    idea_id: String,
    requested: Option<bool>,
    resolved: Option<bool>,
    previous: Option<bool>,
}

impl SetFavorite {
    /// Flips whatever the invoking view currently shows.
    pub fn toggle(idea_id: impl Into<String>) -> Self {
        Self {
            idea_id: idea_id.into(),
            requested: None,
            resolved: None,
            previous: None,
        }
    }

    /// Sets an explicit value; repeating it is idempotent.
    pub fn to(idea_id: impl Into<String>, is_favorite: bool) -> Self {
        Self {
            idea_id: idea_id.into(),
            requested: Some(is_favorite),
            resolved: Some(is_favorite),
            previous: None,
        }
    }
}

#[async_trait::async_trait]
impl Mutation for SetFavorite {
    fn idea_id(&self) -> &str {
        &self.idea_id
    }

    fn action(&self) -> ActionKind {
        ActionKind::Favorite
    }

    fn apply(&mut self, view: &ViewHandle) {
        let requested = self.requested;
        if let Some((previous, target)) = view.update_idea(&self.idea_id, |idea| {
            let previous = idea.is_favorite;
            let target = requested.unwrap_or(!previous);
            idea.is_favorite = target;
            (previous, target)
        }) {
            self.previous = Some(previous);
            self.resolved = Some(target);
        }
    }

    async fn commit(&mut self, owner_id: &str, store: &dyn IdeaStore) -> AppResult<DashboardEvent> {
        let is_favorite = match self.resolved {
            Some(value) => value,
            None => {
                let current = store.get_idea(owner_id, &self.idea_id).await?;
                let value = !current.is_favorite;
                self.resolved = Some(value);
                value
            }
        };
        store.set_favorite(owner_id, &self.idea_id, is_favorite).await?;
        Ok(DashboardEvent::FavoriteUpdated(FavoriteUpdated {
            idea_id: self.idea_id.clone(),
            is_favorite,
        }))
    }

    fn rollback(&mut self, view: &ViewHandle) {
        if let Some(previous) = self.previous {
            view.update_idea(&self.idea_id, |idea| idea.is_favorite = previous);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetTags {
    idea_id: String,
    tags: Vec<Tag>,
    previous: Option<Vec<Tag>>,
}

impl SetTags {
    pub fn new(idea_id: impl Into<String>, tags: Vec<Tag>) -> Self {
        Self {
            idea_id: idea_id.into(),
            tags,
            previous: None,
        }
    }
}

#[async_trait::async_trait]
impl Mutation for SetTags {
    fn idea_id(&self) -> &str {
        &self.idea_id
    }

    fn action(&self) -> ActionKind {
        ActionKind::Tags
    }

    fn apply(&mut self, view: &ViewHandle) {
        let tags = self.tags.clone();
        self.previous = view.update_idea(&self.idea_id, |idea| std::mem::replace(&mut idea.tags, tags));
    }

    async fn commit(&mut self, owner_id: &str, store: &dyn IdeaStore) -> AppResult<DashboardEvent> {
        let tag_ids: Vec<String> = self.tags.iter().map(|tag| tag.id.clone()).collect();
        let tags = store.set_idea_tags(owner_id, &self.idea_id, &tag_ids).await?;
        Ok(DashboardEvent::TagsUpdated(TagsUpdated {
            idea_id: self.idea_id.clone(),
            tags,
        }))
    }

    fn rollback(&mut self, view: &ViewHandle) {
        if let Some(previous) = self.previous.take() {
            view.update_idea(&self.idea_id, |idea| idea.tags = previous);
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteIdea {
    idea_id: String,
    removed: Option<(usize, Idea)>,
}

impl DeleteIdea {
    pub fn new(idea_id: impl Into<String>) -> Self {
        Self {
            idea_id: idea_id.into(),
            removed: None,
        }
    }
}

#[async_trait::async_trait]
impl Mutation for DeleteIdea {
    fn idea_id(&self) -> &str {
        &self.idea_id
    }

    fn action(&self) -> ActionKind {
        ActionKind::Delete
    }

    fn confirmation_prompt(&self, view: &ViewHandle) -> Option<String> {
        let title = view
            .idea(&self.idea_id)
            .map(|idea| format!("\"{}\"", idea.title))
            .unwrap_or_else(|| "this idea".to_string());
        Some(format!("Delete {}? Its analysis and tags will be removed. This cannot be undone.", title))
    }

    fn apply(&mut self, view: &ViewHandle) {
        self.removed = view.remove_idea(&self.idea_id);
    }

    async fn commit(&mut self, owner_id: &str, store: &dyn IdeaStore) -> AppResult<DashboardEvent> {
        store.delete_idea(owner_id, &self.idea_id).await?;
        Ok(DashboardEvent::IdeaDeleted(IdeaDeleted {
            idea_id: self.idea_id.clone(),
        }))
    }

    fn rollback(&mut self, view: &ViewHandle) {
        if let Some((index, idea)) = self.removed.take() {
            view.restore_idea(index, idea);
        }
    }
}

/// Blocking yes/no prompt shown before destructive mutations.
#[async_trait::async_trait]
pub trait ConfirmGate: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Confirms everything; for headless sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait::async_trait]
impl ConfirmGate for AutoConfirm {
    async fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Committed(DashboardEvent),
    /// Dropped by the per-(id, action) cooldown; nothing was written.
    Throttled,
    /// The user declined the confirm gate; nothing was written.
    Declined,
}

#[derive(Clone)]
pub struct MutationExecutor {
    owner_id: String,
    store: Arc<dyn IdeaStore>,
    bus: EventBus,
    guard: ActionGuard,
    notifier: Arc<dyn Notifier>,
    confirm: Arc<dyn ConfirmGate>,
    pipeline: AnalysisPipeline,
}

impl MutationExecutor {
    pub fn new(
        owner_id: impl Into<String>,
        store: Arc<dyn IdeaStore>,
        bus: EventBus,
        guard: ActionGuard,
        notifier: Arc<dyn Notifier>,
        confirm: Arc<dyn ConfirmGate>,
        pipeline: AnalysisPipeline,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            store,
            bus,
            guard,
            notifier,
            confirm,
            pipeline,
        }
    }

    /// Runs confirm → guard → apply → commit, rolling back and notifying on failure.
    pub async fn execute<M: Mutation>(&self, view: &ViewHandle, mut mutation: M) -> AppResult<MutationOutcome> {
        let idea_id = mutation.idea_id().to_string();
        let action = mutation.action();

        // a declined confirm must not use up the cooldown window
        if let Some(prompt) = mutation.confirmation_prompt(view) {
            if !self.confirm.confirm(&prompt).await {
                tracing::debug!(idea_id = %idea_id, action = action.as_str(), "mutation declined");
                return Ok(MutationOutcome::Declined);
            }
        }

        if !self.guard.try_acquire(&idea_id, action) {
            tracing::debug!(idea_id = %idea_id, action = action.as_str(), "mutation dropped by cooldown");
            return Ok(MutationOutcome::Throttled);
        }

        mutation.apply(view);

        match mutation.commit(&self.owner_id, self.store.as_ref()).await {
            Ok(event) => {
                view.apply_event(&event);
                let delivered = self.bus.publish(&event);
                tracing::info!(
                    idea_id = %idea_id,
                    action = action.as_str(),
                    event = event.name(),
                    delivered,
                    "mutation committed"
                );
                Ok(MutationOutcome::Committed(event))
            }
            Err(error) => {
                mutation.rollback(view);
                tracing::warn!(
                    idea_id = %idea_id,
                    action = action.as_str(),
                    error = %error,
                    "mutation rolled back"
                );
                self.notifier.notify(Notice::from_error(&error));
                Err(error)
            }
        }
    }

    pub async fn toggle_favorite(&self, view: &ViewHandle, idea_id: &str) -> AppResult<MutationOutcome> {
        self.execute(view, SetFavorite::toggle(idea_id)).await
    }

    pub async fn set_favorite(&self, view: &ViewHandle, idea_id: &str, is_favorite: bool) -> AppResult<MutationOutcome> {
        self.execute(view, SetFavorite::to(idea_id, is_favorite)).await
    }

    pub async fn set_tags(&self, view: &ViewHandle, idea_id: &str, tags: Vec<Tag>) -> AppResult<MutationOutcome> {
        self.execute(view, SetTags::new(idea_id, tags)).await
    }

    pub async fn delete_idea(&self, view: &ViewHandle, idea_id: &str) -> AppResult<MutationOutcome> {
        self.execute(view, DeleteIdea::new(idea_id)).await
    }

    /// Guards repeated taps, then hands off to the analysis pipeline, which owns
    /// charging, notices and the `analysis-updated` broadcast. `None` means the
    /// tap was dropped by the cooldown.
    pub async fn reanalyze(&self, idea_id: &str) -> AppResult<Option<Analysis>> {
        if !self.guard.try_acquire(idea_id, ActionKind::Analyze) {
            tracing::debug!(idea_id = %idea_id, "reanalysis dropped by cooldown");
            return Ok(None);
        }
        self.pipeline.run(idea_id, AnalysisKind::Reanalysis).await.map(Some)
    }
}

impl std::fmt::Debug for MutationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationExecutor")
            .field("owner_id", &self.owner_id)
            .field("cooldown", &self.guard.window())
            .finish()
    }
}
