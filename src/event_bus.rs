//! Typed, synchronous, in-memory publish/subscribe for idea state changes.
//!
//! Each channel is a [`Topic`] with its own payload type. Delivery happens on
//! the publisher's call stack, in subscription order, to whoever is subscribed
//! at that moment; nothing is buffered or replayed. Subscriptions are guards:
//! dropping one detaches its handler.

use crate::models::{Analysis, Tag};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub const ANALYSIS_UPDATED: &str = "analysis-updated";
pub const FAVORITE_UPDATED: &str = "favorite-updated";
pub const TAGS_UPDATED: &str = "tags-updated";
pub const IDEA_DELETED: &str = "idea-deleted";
pub const LANGUAGE_CHANGED: &str = "language-changed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisUpdated {
    pub idea_id: String,
    pub analysis: Analysis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteUpdated {
    pub idea_id: String,
    pub is_favorite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagsUpdated {
    pub idea_id: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeaDeleted {
    pub idea_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageChanged {
    pub language: String,
}

/// Any event the bus carries, as `{name, payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "kebab-case")]
pub enum DashboardEvent {
    AnalysisUpdated(AnalysisUpdated),
    FavoriteUpdated(FavoriteUpdated),
    TagsUpdated(TagsUpdated),
    IdeaDeleted(IdeaDeleted),
    LanguageChanged(LanguageChanged),
}

impl DashboardEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AnalysisUpdated(_) => ANALYSIS_UPDATED,
            Self::FavoriteUpdated(_) => FAVORITE_UPDATED,
            Self::TagsUpdated(_) => TAGS_UPDATED,
            Self::IdeaDeleted(_) => IDEA_DELETED,
            Self::LanguageChanged(_) => LANGUAGE_CHANGED,
        }
    }

    pub fn idea_id(&self) -> Option<&str> {
        match self {
            Self::AnalysisUpdated(event) => Some(&event.idea_id),
            Self::FavoriteUpdated(event) => Some(&event.idea_id),
            Self::TagsUpdated(event) => Some(&event.idea_id),
            Self::IdeaDeleted(event) => Some(&event.idea_id),
            Self::LanguageChanged(_) => None,
        }
    }
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    handlers: Vec<(u64, Handler<E>)>,
}

fn lock_registry<E>(registry: &Mutex<Registry<E>>) -> MutexGuard<'_, Registry<E>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One typed channel.
pub struct Topic<E> {
    name: &'static str,
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for Topic<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            registry: self.registry.clone(),
        }
    }
}

impl<E: 'static> Topic<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock_registry(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            channel: self.name,
            id,
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock_registry(&registry).handlers.retain(|(handler_id, _)| *handler_id != id);
                }
            })),
        }
    }

    /// Delivers `event` to the current subscribers and returns how many saw it.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe while being called.
    pub fn publish(&self, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = lock_registry(&self.registry)
            .handlers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        tracing::debug!(channel = self.name, subscriber_count = handlers.len(), "event bus publish");
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock_registry(&self.registry).handlers.len()
    }
}

/// Detaches its handler when dropped or when [`Subscription::unsubscribe`] is called.
pub struct Subscription {
    channel: &'static str,
    id: u64,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn channel(&self) -> &'static str {
        self.channel
    }

    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
            tracing::trace!(channel = self.channel, subscription_id = self.id, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("active", &self.detach.is_some())
            .finish()
    }
}

/// The set of channels shared by every view of one session.
#[derive(Clone)]
pub struct EventBus {
    analysis_updated: Topic<AnalysisUpdated>,
    favorite_updated: Topic<FavoriteUpdated>,
    tags_updated: Topic<TagsUpdated>,
    idea_deleted: Topic<IdeaDeleted>,
    language_changed: Topic<LanguageChanged>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            analysis_updated: Topic::new(ANALYSIS_UPDATED),
            favorite_updated: Topic::new(FAVORITE_UPDATED),
            tags_updated: Topic::new(TAGS_UPDATED),
            idea_deleted: Topic::new(IDEA_DELETED),
            language_changed: Topic::new(LANGUAGE_CHANGED),
        }
    }

    pub fn analysis_updated(&self) -> &Topic<AnalysisUpdated> {
        &self.analysis_updated
    }

    pub fn favorite_updated(&self) -> &Topic<FavoriteUpdated> {
        &self.favorite_updated
    }

    pub fn tags_updated(&self) -> &Topic<TagsUpdated> {
        &self.tags_updated
    }

    pub fn idea_deleted(&self) -> &Topic<IdeaDeleted> {
        &self.idea_deleted
    }

    pub fn language_changed(&self) -> &Topic<LanguageChanged> {
        &self.language_changed
    }

    /// Routes an untyped event to its channel.
    pub fn publish(&self, event: &DashboardEvent) -> usize {
        match event {
            DashboardEvent::AnalysisUpdated(payload) => self.analysis_updated.publish(payload),
            DashboardEvent::FavoriteUpdated(payload) => self.favorite_updated.publish(payload),
            DashboardEvent::TagsUpdated(payload) => self.tags_updated.publish(payload),
            DashboardEvent::IdeaDeleted(payload) => self.idea_deleted.publish(payload),
            DashboardEvent::LanguageChanged(payload) => self.language_changed.publish(payload),
        }
    }
}
