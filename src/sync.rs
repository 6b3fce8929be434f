//! Per-view local copies of ideas, kept current from bus events.
//!
//! A view fetches its subset once on mount and afterwards only patches ideas
//! it already holds. Events naming ids the view does not hold are ignored, and
//! no event ever triggers a refetch.

use crate::backend::IdeaStore;
use crate::errors::AppResult;
use crate::event_bus::{DashboardEvent, EventBus, Subscription};
use crate::models::{Idea, IdeaScope};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub total: usize,
    pub favorites: usize,
    pub analyzed: usize,
    pub average_score: Option<f64>,
}

#[derive(Debug)]
struct ViewState {
    name: String,
    scope: IdeaScope,
    ideas: Vec<Idea>,
    language: Option<String>,
    mounted: bool,
    hydrating: bool,
    gone: bool,
    pending: Vec<DashboardEvent>,
}

impl ViewState {
    fn position(&self, idea_id: &str) -> Option<usize> {
        self.ideas.iter().position(|idea| idea.id == idea_id)
    }

    fn receive(&mut self, event: DashboardEvent) -> bool {
        if !self.mounted {
            return false;
        }
        if self.hydrating {
            self.pending.push(event);
            return false;
        }
        self.apply(&event)
    }

    fn apply(&mut self, event: &DashboardEvent) -> bool {
        if let DashboardEvent::LanguageChanged(payload) = event {
            let changed = self.language.as_deref() != Some(payload.language.as_str());
            self.language = Some(payload.language.clone());
            return changed;
        }

        let Some(index) = event.idea_id().and_then(|idea_id| self.position(idea_id)) else {
            return false;
        };

        let changed = match event {
            DashboardEvent::FavoriteUpdated(payload) => {
                let idea = &mut self.ideas[index];
                let changed = idea.is_favorite != payload.is_favorite;
                idea.is_favorite = payload.is_favorite;
                if self.scope == IdeaScope::Favorites && !payload.is_favorite {
                    self.ideas.remove(index);
                    return true;
                }
                changed
            }
            DashboardEvent::TagsUpdated(payload) => {
                let idea = &mut self.ideas[index];
                let changed = idea.tags != payload.tags;
                idea.tags = payload.tags.clone();
                changed
            }
            DashboardEvent::AnalysisUpdated(payload) => {
                let idea = &mut self.ideas[index];
                let changed = idea.analysis.as_ref() != Some(&payload.analysis);
                idea.analysis = Some(payload.analysis.clone());
                changed
            }
            DashboardEvent::IdeaDeleted(payload) => {
                self.ideas.remove(index);
                if self.scope == IdeaScope::Single(payload.idea_id.clone()) {
                    self.gone = true;
                }
                true
            }
            DashboardEvent::LanguageChanged(_) => false,
        };

        if changed {
            tracing::debug!(view = %self.name, event = event.name(), index, "view patched");
        }
        changed
    }
}

fn lock_state(state: &Mutex<ViewState>) -> MutexGuard<'_, ViewState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared handle to a view's local state.
///
/// Every write through a handle is a no-op once the view has been unmounted,
/// so late network responses cannot resurrect torn-down state.
#[derive(Debug, Clone)]
pub struct ViewHandle {
    state: Arc<Mutex<ViewState>>,
}

impl ViewHandle {
    pub fn name(&self) -> String {
        lock_state(&self.state).name.clone()
    }

    pub fn scope(&self) -> IdeaScope {
        lock_state(&self.state).scope.clone()
    }

    pub fn is_mounted(&self) -> bool {
        lock_state(&self.state).mounted
    }

    /// True for a detail view whose idea was deleted; the UI should go back to the list.
    pub fn is_gone(&self) -> bool {
        lock_state(&self.state).gone
    }

    pub fn contains(&self, idea_id: &str) -> bool {
        lock_state(&self.state).position(idea_id).is_some()
    }

    pub fn idea(&self, idea_id: &str) -> Option<Idea> {
        let state = lock_state(&self.state);
        state.position(idea_id).map(|index| state.ideas[index].clone())
    }

    pub fn ideas(&self) -> Vec<Idea> {
        lock_state(&self.state).ideas.clone()
    }

    pub fn idea_ids(&self) -> Vec<String> {
        lock_state(&self.state).ideas.iter().map(|idea| idea.id.clone()).collect()
    }

    pub fn language(&self) -> Option<String> {
        lock_state(&self.state).language.clone()
    }

    pub fn summary(&self) -> DashboardSummary {
        let state = lock_state(&self.state);
        let scores: Vec<f64> = state
            .ideas
            .iter()
            .filter_map(|idea| idea.analysis.as_ref().map(|analysis| f64::from(analysis.score)))
            .collect();
        let average_score = if scores.is_empty() {
            None
        } else {
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            Some((mean * 10.0).round() / 10.0)
        };
        DashboardSummary {
            total: state.ideas.len(),
            favorites: state.ideas.iter().filter(|idea| idea.is_favorite).count(),
            analyzed: scores.len(),
            average_score,
        }
    }

    /// Applies `update` to the local copy of `idea_id`. Returns `None` when the
    /// view is unmounted or does not hold the idea.
    pub fn update_idea<R>(&self, idea_id: &str, update: impl FnOnce(&mut Idea) -> R) -> Option<R> {
        let mut state = lock_state(&self.state);
        if !state.mounted {
            return None;
        }
        let index = state.position(idea_id)?;
        Some(update(&mut state.ideas[index]))
    }

    /// Removes the idea locally, returning its position and value for a later restore.
    pub fn remove_idea(&self, idea_id: &str) -> Option<(usize, Idea)> {
        let mut state = lock_state(&self.state);
        if !state.mounted {
            return None;
        }
        let index = state.position(idea_id)?;
        Some((index, state.ideas.remove(index)))
    }

    pub fn restore_idea(&self, index: usize, idea: Idea) {
        let mut state = lock_state(&self.state);
        if !state.mounted || state.position(&idea.id).is_some() {
            return;
        }
        let index = index.min(state.ideas.len());
        state.ideas.insert(index, idea);
    }

    /// Applies a bus event directly; returns whether local state changed.
    pub fn apply_event(&self, event: &DashboardEvent) -> bool {
        lock_state(&self.state).receive(event.clone())
    }
}

fn forward(state: &Weak<Mutex<ViewState>>, event: DashboardEvent) {
    if let Some(state) = state.upgrade() {
        lock_state(&state).receive(event);
    }
}

/// A mounted view: its local state plus the bus subscriptions feeding it.
#[derive(Debug)]
pub struct ViewSynchronizer {
    handle: ViewHandle,
    subscriptions: Vec<Subscription>,
}

impl ViewSynchronizer {
    /// Subscribes, performs the single authoritative fetch, then replays events
    /// that arrived while the fetch was in flight.
    pub async fn mount(
        name: impl Into<String>,
        owner_id: &str,
        scope: IdeaScope,
        store: &dyn IdeaStore,
        bus: &EventBus,
    ) -> AppResult<Self> {
        let name = name.into();
        let state = Arc::new(Mutex::new(ViewState {
            name: name.clone(),
            scope: scope.clone(),
            ideas: Vec::new(),
            language: None,
            mounted: true,
            hydrating: true,
            gone: false,
            pending: Vec::new(),
        }));
        let subscriptions = subscribe_all(&state, bus);

        let ideas = match store.list_ideas(owner_id, &scope).await {
            Ok(ideas) => ideas,
            Err(error) => {
                lock_state(&state).mounted = false;
                tracing::warn!(view = %name, error = %error, "view hydration failed");
                return Err(error);
            }
        };

        {
            let mut guard = lock_state(&state);
            guard.ideas = ideas;
            guard.hydrating = false;
            let pending = std::mem::take(&mut guard.pending);
            for event in &pending {
                guard.apply(event);
            }
            tracing::debug!(
                view = %name,
                ideas = guard.ideas.len(),
                replayed = pending.len(),
                "view mounted"
            );
        }

        Ok(Self {
            handle: ViewHandle { state },
            subscriptions,
        })
    }

    pub fn handle(&self) -> ViewHandle {
        self.handle.clone()
    }

    /// Detaches from the bus and turns every outstanding handle into a no-op.
    pub fn unmount(self) {
        drop(self);
    }
}

impl Drop for ViewSynchronizer {
    fn drop(&mut self) {
        self.subscriptions.clear();
        let mut state = lock_state(&self.handle.state);
        state.mounted = false;
        tracing::debug!(view = %state.name, "view unmounted");
    }
}

fn subscribe_all(state: &Arc<Mutex<ViewState>>, bus: &EventBus) -> Vec<Subscription> {
    let weak = Arc::downgrade(state);
    vec![
        {
            let weak = weak.clone();
            bus.favorite_updated()
                .subscribe(move |payload| forward(&weak, DashboardEvent::FavoriteUpdated(payload.clone())))
        },
        {
            let weak = weak.clone();
            bus.tags_updated()
                .subscribe(move |payload| forward(&weak, DashboardEvent::TagsUpdated(payload.clone())))
        },
        {
            let weak = weak.clone();
            bus.analysis_updated()
                .subscribe(move |payload| forward(&weak, DashboardEvent::AnalysisUpdated(payload.clone())))
        },
        {
            let weak = weak.clone();
            bus.idea_deleted()
                .subscribe(move |payload| forward(&weak, DashboardEvent::IdeaDeleted(payload.clone())))
        },
        bus.language_changed()
            .subscribe(move |payload| forward(&weak, DashboardEvent::LanguageChanged(payload.clone()))),
    ]
}
