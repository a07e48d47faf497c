//! Group: broadcast one trigger to many peers.
//!
//! A group never keeps a member's session alive. Each member is held as a
//! weak handle plus a close hook on the member that removes it again, so a
//! closed session drops out of every group it belongs to without an
//! explicit [`Group::remove`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;

use crate::codec::{Codec, PostcardCodec};
use crate::session::SessionId;
use crate::signal::{HookId, Signaler, SignalerInner};
use crate::{GroupError, MemberFailure, SignalError};

struct Member {
    signaler: Weak<SignalerInner>,
    hook: HookId,
}

#[derive(Default)]
struct GroupInner {
    members: Mutex<HashMap<SessionId, Member>>,
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        for member in self.members.get_mut().values() {
            if let Some(signaler) = member.signaler.upgrade() {
                Signaler::from_inner(signaler).remove_close_hook(member.hook);
            }
        }
    }
}

/// A set of signalers triggered together. Cheap to clone; clones share
/// membership.
#[derive(Clone, Default)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("len", &self.len()).finish()
    }
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add members. `None`, closed signalers and existing members are
    /// skipped.
    pub fn add<'a, I>(&self, signalers: I)
    where
        I: IntoIterator,
        I::Item: Into<Option<&'a Signaler>>,
    {
        for signaler in signalers {
            let Some(signaler) = signaler.into() else {
                continue;
            };
            self.add_one(signaler);
        }
    }

    fn add_one(&self, signaler: &Signaler) {
        let session = signaler.session_id();
        if self.inner.members.lock().contains_key(&session) {
            return;
        }

        let group = Arc::downgrade(&self.inner);
        let Some(hook) = signaler.on_close(move || prune(&group, session)) else {
            tracing::debug!(session = %session, "not adding closed signaler to group");
            return;
        };

        let mut members = self.inner.members.lock();
        if members.contains_key(&session) {
            drop(members);
            signaler.remove_close_hook(hook);
            return;
        }
        members.insert(
            session,
            Member {
                signaler: signaler.downgrade(),
                hook,
            },
        );
        tracing::debug!(session = %session, members = members.len(), "group member added");
    }

    /// Remove a member. Returns whether it was present.
    pub fn remove(&self, signaler: &Signaler) -> bool {
        let removed = self.inner.members.lock().remove(&signaler.session_id());
        match removed {
            Some(member) => {
                signaler.remove_close_hook(member.hook);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, signaler: &Signaler) -> bool {
        self.inner
            .members
            .lock()
            .contains_key(&signaler.session_id())
    }

    pub fn len(&self) -> usize {
        self.inner.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trigger `id` on every member not in `excluded`.
    ///
    /// Members are triggered concurrently. A member failure never stops
    /// delivery to the others; failures are reported together once every
    /// member has been attempted. Members found closed are removed.
    pub async fn trigger_signal<T>(
        &self,
        id: &str,
        data: &T,
        excluded: &[&Signaler],
    ) -> Result<(), GroupError>
    where
        T: Serialize + ?Sized,
    {
        let data = PostcardCodec::encode(data)?;
        self.trigger_signal_raw(id, Bytes::from(data), excluded)
            .await
    }

    pub async fn trigger_signal_raw(
        &self,
        id: &str,
        data: Bytes,
        excluded: &[&Signaler],
    ) -> Result<(), GroupError> {
        let excluded: HashSet<SessionId> = excluded.iter().map(|s| s.session_id()).collect();

        let mut gone = Vec::new();
        let targets: Vec<(SessionId, Signaler)> = {
            let members = self.inner.members.lock();
            members
                .iter()
                .filter(|(session, _)| !excluded.contains(session))
                .filter_map(|(session, member)| match member.signaler.upgrade() {
                    Some(inner) => Some((*session, Signaler::from_inner(inner))),
                    None => {
                        gone.push(*session);
                        None
                    }
                })
                .collect()
        };

        let results = join_all(targets.iter().map(|(session, signaler)| {
            let data = data.clone();
            async move { (*session, signaler.trigger_signal_raw(id, data).await) }
        }))
        .await;

        let mut failures = Vec::new();
        for (session, result) in results {
            match result {
                Ok(()) => {}
                Err(SignalError::Closed) => gone.push(session),
                Err(error) => {
                    tracing::warn!(session = %session, signal = id, error = %error, "group member trigger failed");
                    failures.push(MemberFailure { session, error });
                }
            }
        }

        if !gone.is_empty() {
            let mut members = self.inner.members.lock();
            for session in &gone {
                members.remove(session);
            }
            tracing::debug!(pruned = gone.len(), "pruned closed group members");
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GroupError::Delivery(failures))
        }
    }
}

fn prune(group: &Weak<GroupInner>, session: SessionId) {
    if let Some(group) = group.upgrade() {
        if group.members.lock().remove(&session).is_some() {
            tracing::debug!(session = %session, "closed member left group");
        }
    }
}
