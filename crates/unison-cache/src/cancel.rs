use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Identifies one member registered with a [`CancelGroup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemberId(u64);

#[derive(Debug)]
struct Member {
    fired: bool,
    /// Cancelling this ends the member's watcher task.
    unsubscribe: CancellationToken,
}

#[derive(Debug, Default)]
struct Members {
    by_id: HashMap<u64, Member>,
    fired: usize,
    next_id: u64,
    closed: bool,
}

/// Reduces a set of caller tokens into one derived token that fires only
/// when *every* member has fired ("all-of").
///
/// Each attached caller owns its token; firing it marks that member as
/// cancelled without touching the others. The derived token fires exactly
/// once, as soon as the member set is non-empty and fully fired, and never
/// for an empty set. Every registration spawns a watcher task on the
/// ambient Tokio runtime, released again by [`remove`](Self::remove) or
/// [`shutdown`](Self::shutdown).
#[derive(Debug, Default)]
pub struct CancelGroup {
    members: Arc<Mutex<Members>>,
    derived: CancellationToken,
}

impl CancelGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// The all-of reduction over the current members.
    pub fn derived(&self) -> CancellationToken {
        self.derived.clone()
    }

    /// Registers a caller token with the group.
    ///
    /// Returns `None` without registering if the token has already fired
    /// (the caller handles its own cancellation) or the group has been shut
    /// down.
    pub fn add(&self, token: &CancellationToken) -> Option<MemberId> {
        if token.is_cancelled() {
            return None;
        }

        let unsubscribe = CancellationToken::new();
        let id = {
            let mut members = self.members.lock();
            if members.closed {
                return None;
            }
            let id = members.next_id;
            members.next_id += 1;
            members.by_id.insert(
                id,
                Member {
                    fired: false,
                    unsubscribe: unsubscribe.clone(),
                },
            );
            id
        };

        // The watcher also catches tokens that fired between the check
        // above and here: `cancelled()` resolves immediately for them.
        let watched = token.clone();
        let members = Arc::clone(&self.members);
        let derived = self.derived.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = unsubscribe.cancelled() => {}
                _ = watched.cancelled() => mark_fired(&members, &derived, id),
            }
        });

        Some(MemberId(id))
    }

    /// Unsubscribes and erases a member, then re-evaluates the group.
    pub fn remove(&self, id: MemberId) {
        let mut guard = self.members.lock();
        let members = &mut *guard;
        if let Some(member) = members.by_id.remove(&id.0) {
            member.unsubscribe.cancel();
            if member.fired {
                members.fired -= 1;
            }
        }
        evaluate(members, &self.derived);
    }

    /// Releases every member subscription and closes the group. Idempotent.
    ///
    /// A closed group accepts no further members; the derived token keeps
    /// whatever state it had.
    pub fn shutdown(&self) {
        let mut members = self.members.lock();
        members.closed = true;
        for member in members.by_id.values() {
            member.unsubscribe.cancel();
        }
        members.by_id.clear();
        members.fired = 0;
    }

    /// Number of currently registered members.
    pub fn member_count(&self) -> usize {
        self.members.lock().by_id.len()
    }
}

fn mark_fired(members: &Mutex<Members>, derived: &CancellationToken, id: u64) {
    let mut guard = members.lock();
    let members = &mut *guard;
    let Some(member) = members.by_id.get_mut(&id) else {
        return;
    };
    if member.fired {
        return;
    }
    member.fired = true;
    members.fired += 1;
    evaluate(members, derived);
}

fn evaluate(members: &Members, derived: &CancellationToken) {
    if !members.by_id.is_empty() && members.fired == members.by_id.len() {
        derived.cancel();
    }
}

/// Derived token that fires as soon as *any* of the inputs fires.
///
/// The dual of [`CancelGroup`]; an empty input yields a token that never
/// fires. Fetchers use this to combine the cache-derived token with ad-hoc
/// cancellation of their own.
pub fn any_of<I>(tokens: I) -> CancellationToken
where
    I: IntoIterator<Item = CancellationToken>,
{
    let derived = CancellationToken::new();
    let waits: Vec<_> = tokens
        .into_iter()
        .map(|token| Box::pin(token.cancelled_owned()))
        .collect();
    if waits.is_empty() {
        return derived;
    }

    let out = derived.clone();
    tokio::spawn(async move {
        futures::future::select_all(waits).await;
        out.cancel();
    });

    derived
}
