//! The single merge function behind every registry write.
//!
//! Rules, in order:
//! - Absent patch fields never clear stored values.
//! - Once a streamed event has written live fields, local patches no longer
//!   touch them (status, screenshot, URL, title, tabs).
//! - Screenshot, URL, title and tabs are written only when the patch is at
//!   least as new as `last_update`. Untimestamped patches apply but leave
//!   `last_update` alone.
//! - Ownership is not patched while a transition is pending; the handoff
//!   coordinator resolves it.

use chrono::{DateTime, Utc};

use cobrowse_core::ids::ContextId;
use cobrowse_core::protocol::{SessionUpdate, TabUpdate, ViewportUpdate};
use cobrowse_core::session::{ControlOwner, Session, SessionStatus, Tab};

/// Where a patch came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// Synchronous local creation (e.g. a start-task response).
    Local,
    /// The real-time stream or a backend snapshot.
    Stream,
}

/// A partial session update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionPatch {
    /// Live-view URL.
    pub browser_url: Option<String>,
    /// Current page URL.
    pub current_url: Option<String>,
    /// Current page title.
    pub current_title: Option<String>,
    /// Screenshot data.
    pub screenshot: Option<String>,
    /// Lifecycle status.
    pub status: Option<SessionStatus>,
    /// Owner.
    pub control_owner: Option<ControlOwner>,
    /// Full tab list.
    pub tabs: Option<Vec<Tab>>,
    /// Owning context.
    pub context_id: Option<ContextId>,
    /// Event time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl SessionPatch {
    fn has_live_fields(&self) -> bool {
        self.current_url.is_some()
            || self.current_title.is_some()
            || self.screenshot.is_some()
            || self.tabs.is_some()
    }
}

impl From<&SessionUpdate> for SessionPatch {
    fn from(update: &SessionUpdate) -> Self {
        Self {
            browser_url: update.browser_url.clone(),
            current_url: update.current_url.clone(),
            current_title: update.current_title.clone(),
            screenshot: update.screenshot.clone(),
            status: update.status.and_then(|s| s.live()),
            control_owner: update.human_control.map(ControlOwner::from_human_control),
            tabs: update.tabs.clone(),
            context_id: update.context_id.clone(),
            timestamp: update.timestamp,
        }
    }
}

impl From<&ViewportUpdate> for SessionPatch {
    fn from(update: &ViewportUpdate) -> Self {
        Self {
            current_url: update.url.clone(),
            current_title: update.title.clone(),
            screenshot: update.screenshot.clone(),
            tabs: update.tabs.clone(),
            timestamp: update.timestamp,
            ..Self::default()
        }
    }
}

impl From<&TabUpdate> for SessionPatch {
    fn from(update: &TabUpdate) -> Self {
        Self {
            tabs: Some(update.tabs.clone()),
            timestamp: update.timestamp,
            ..Self::default()
        }
    }
}

/// What a merge did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Any stored field changed.
    pub changed: bool,
    /// Live fields were skipped because the patch was older than `last_update`.
    pub stale: bool,
    /// `(previous, current)` when the owner changed.
    pub owner_changed: Option<(ControlOwner, ControlOwner)>,
}

fn set<T: PartialEq>(slot: &mut T, value: T, changed: &mut bool) {
    if *slot != value {
        *slot = value;
        *changed = true;
    }
}

/// Merge `patch` into `session`.
pub fn apply_patch(
    session: &mut Session,
    patch: SessionPatch,
    provenance: Provenance,
) -> MergeOutcome {
    let mut out = MergeOutcome::default();
    let live_allowed = provenance == Provenance::Stream || !session.live_seen;
    let has_live = patch.has_live_fields();
    let has_status = patch.status.is_some();

    if let Some(url) = patch.browser_url {
        set(&mut session.browser_url, Some(url), &mut out.changed);
    }
    if let Some(ctx) = patch.context_id {
        set(&mut session.context_id, Some(ctx), &mut out.changed);
    }

    if live_allowed {
        if let Some(status) = patch.status {
            set(&mut session.status, status, &mut out.changed);
        }

        let fresh = match (patch.timestamp, session.last_update) {
            (Some(ts), Some(last)) => ts >= last,
            _ => true,
        };
        if fresh {
            if let Some(url) = patch.current_url {
                set(&mut session.current_url, Some(url), &mut out.changed);
            }
            if let Some(title) = patch.current_title {
                set(&mut session.current_title, Some(title), &mut out.changed);
            }
            if let Some(shot) = patch.screenshot {
                set(&mut session.screenshot, Some(shot), &mut out.changed);
            }
            if let Some(tabs) = patch.tabs {
                set(&mut session.tabs, tabs, &mut out.changed);
            }
            if has_live {
                if let Some(ts) = patch.timestamp {
                    set(&mut session.last_update, Some(ts), &mut out.changed);
                }
            }
        } else {
            out.stale = has_live;
        }
    }

    if provenance == Provenance::Stream && (has_status || has_live) {
        session.live_seen = true;
    }

    if let Some(owner) = patch.control_owner {
        if session.pending_transition.is_none() && session.control_owner != owner {
            let previous = session.control_owner;
            session.control_owner = owner;
            out.changed = true;
            out.owner_changed = Some((previous, owner));
        }
    }

    out
}
