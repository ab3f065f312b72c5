use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::sync::broadcast;

use super::group::ConsumerGroup;
use crate::bus::broker::types::{BusEvent, GroupInfo, TopicPartition};
use crate::bus::topic::TopicRegistry;
use crate::error::{BusError, BusResult};
use crate::storage::{LogStore, OffsetSnapshot};

/// Group state shared between the coordinator actor (sole writer) and readers.
pub type GroupCache = Arc<RwLock<HashMap<String, ConsumerGroup>>>;

struct GroupCoordinatorActor;

pub(crate) enum CoordinatorMessage {
    Join {
        group_id: String,
        member_id: String,
        client_id: String,
        topics: Vec<String>,
        reply: RpcReplyPort<BusResult<Vec<TopicPartition>>>,
    },
    Leave {
        group_id: String,
        member_id: String,
        reply: RpcReplyPort<BusResult<()>>,
    },
    Commit {
        group_id: String,
        member_id: String,
        offsets: Vec<(TopicPartition, i64)>,
        reply: RpcReplyPort<BusResult<()>>,
    },
    Restore {
        snapshots: BTreeMap<String, OffsetSnapshot>,
        reply: RpcReplyPort<BusResult<usize>>,
    },
}

struct State {
    registry: Arc<TopicRegistry>,
    cache: GroupCache,
    store: Option<Arc<dyn LogStore>>,
    events: broadcast::Sender<BusEvent>,
}

fn read_groups(cache: &GroupCache) -> RwLockReadGuard<'_, HashMap<String, ConsumerGroup>> {
    cache.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_groups(cache: &GroupCache) -> RwLockWriteGuard<'_, HashMap<String, ConsumerGroup>> {
    cache.write().unwrap_or_else(PoisonError::into_inner)
}

impl State {
    fn announce(&self, group_id: &str, generation: i32, members: usize) {
        info!(
            "Rebalanced group {}: generation {}, {} members",
            group_id, generation, members
        );
        let _ = self.events.send(BusEvent::GroupRebalanced {
            group_id: group_id.to_string(),
            generation,
            members,
        });
    }

    fn join(
        &self,
        group_id: String,
        member_id: String,
        client_id: String,
        topics: Vec<String>,
    ) -> BusResult<Vec<TopicPartition>> {
        let (assignment, rebalanced) = {
            let mut groups = write_groups(&self.cache);
            let group = groups
                .entry(group_id.clone())
                .or_insert_with(|| ConsumerGroup::new(&group_id));
            let changed = group.upsert_member(&member_id, &client_id, &topics);
            if changed {
                group.rebalance(|topic| self.registry.partition_count(topic));
            }
            (
                group.assignment_for(&member_id),
                changed.then_some((group.generation, group.members.len())),
            )
        };

        debug!(
            "Member {} of group {} subscribed to {:?}, assigned {:?}",
            member_id, group_id, topics, assignment
        );
        if let Some((generation, members)) = rebalanced {
            self.announce(&group_id, generation, members);
        }
        Ok(assignment)
    }

    fn leave(&self, group_id: String, member_id: String) -> BusResult<()> {
        let (generation, members) = {
            let mut groups = write_groups(&self.cache);
            let group = groups
                .get_mut(&group_id)
                .ok_or_else(|| BusError::GroupNotFound(group_id.clone()))?;
            if group.remove_member(&member_id).is_none() {
                return Err(BusError::UnknownMember {
                    group_id,
                    member_id,
                });
            }
            if group.is_empty() {
                // Committed offsets stay for members that join later.
                group.clear_assignment();
            } else {
                group.rebalance(|topic| self.registry.partition_count(topic));
            }
            (group.generation, group.members.len())
        };

        info!("Member {} left group {}", member_id, group_id);
        self.announce(&group_id, generation, members);
        Ok(())
    }

    async fn commit(
        &self,
        group_id: String,
        member_id: String,
        offsets: Vec<(TopicPartition, i64)>,
    ) -> BusResult<()> {
        for (tp, _) in &offsets {
            self.registry.get(&tp.topic)?.partition(tp.partition)?;
        }

        let snapshot = {
            let groups = read_groups(&self.cache);
            let group = groups
                .get(&group_id)
                .ok_or_else(|| BusError::GroupNotFound(group_id.clone()))?;
            if !group.has_member(&member_id) {
                return Err(BusError::UnknownMember {
                    group_id,
                    member_id,
                });
            }
            // A member that lost a partition in a rebalance must not move the
            // new owner's position.
            if let Some((tp, _)) = offsets
                .iter()
                .find(|(tp, _)| group.owner(tp) != Some(member_id.as_str()))
            {
                warn!(
                    "Rejected commit for {} from {}: not its partition in group {}",
                    tp, member_id, group_id
                );
                return Err(BusError::NotAssigned {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    group_id,
                    member_id,
                });
            }
            let mut snapshot = group.offsets.clone();
            snapshot.extend(offsets.iter().cloned());
            snapshot
        };

        // Persist first so memory never runs ahead of disk.
        if let Some(store) = &self.store {
            if let Err(e) = store.write_offsets(&group_id, &snapshot).await {
                error!("Failed to persist offsets for group {}: {}", group_id, e);
                return Err(e);
            }
        }

        if let Some(group) = write_groups(&self.cache).get_mut(&group_id) {
            group.offsets.extend(offsets.iter().cloned());
        }
        debug!(
            "Committed {} offsets for group {} by {}",
            offsets.len(),
            group_id,
            member_id
        );
        Ok(())
    }

    fn restore(&self, snapshots: BTreeMap<String, OffsetSnapshot>) -> BusResult<usize> {
        let mut groups = write_groups(&self.cache);
        let restored = snapshots.len();
        for (group_id, snapshot) in snapshots {
            let group = groups
                .entry(group_id.clone())
                .or_insert_with(|| ConsumerGroup::new(&group_id));
            group.offsets.extend(snapshot);
        }
        Ok(restored)
    }
}

impl Actor for GroupCoordinatorActor {
    type Msg = CoordinatorMessage;
    type State = State;
    type Arguments = State;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(args)
    }

    // Failures go back to the caller through the reply port; returning an
    // error here would stop the actor.
    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CoordinatorMessage::Join {
                group_id,
                member_id,
                client_id,
                topics,
                reply,
            } => {
                let _ = reply.send(state.join(group_id, member_id, client_id, topics));
            }
            CoordinatorMessage::Leave {
                group_id,
                member_id,
                reply,
            } => {
                let _ = reply.send(state.leave(group_id, member_id));
            }
            CoordinatorMessage::Commit {
                group_id,
                member_id,
                offsets,
                reply,
            } => {
                let result = state.commit(group_id, member_id, offsets).await;
                let _ = reply.send(result);
            }
            CoordinatorMessage::Restore { snapshots, reply } => {
                let _ = reply.send(state.restore(snapshots));
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        debug!("Group coordinator stopped");
        Ok(())
    }
}

/// Handle to the group coordinator.
///
/// Membership changes and commits are serialised through the actor; reads go
/// straight to the shared cache and may observe a stale assignment while a
/// rebalance is in flight.
pub struct GroupCoordinator {
    actor: ActorRef<CoordinatorMessage>,
    cache: GroupCache,
    timeout: Duration,
}

impl GroupCoordinator {
    pub async fn start(
        registry: Arc<TopicRegistry>,
        store: Option<Arc<dyn LogStore>>,
        events: broadcast::Sender<BusEvent>,
        timeout: Duration,
    ) -> BusResult<Self> {
        let cache = GroupCache::default();
        let state = State {
            registry,
            cache: cache.clone(),
            store,
            events,
        };
        let (actor, _handle) = Actor::spawn(None, GroupCoordinatorActor, state)
            .await
            .map_err(|e| {
                error!("Failed to start group coordinator: {}", e);
                BusError::CoordinatorUnavailable
            })?;
        info!("Started group coordinator");
        Ok(Self {
            actor,
            cache,
            timeout: timeout.max(Duration::from_millis(1)),
        })
    }

    async fn call<T, F>(&self, build: F) -> BusResult<T>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<BusResult<T>>) -> CoordinatorMessage,
    {
        match self.actor.call(build, Some(self.timeout)).await {
            Ok(CallResult::Success(result)) => result,
            Ok(CallResult::Timeout) => {
                warn!("Group coordinator call timed out after {:?}", self.timeout);
                Err(BusError::CoordinatorUnavailable)
            }
            Ok(CallResult::SenderError) | Err(_) => Err(BusError::CoordinatorUnavailable),
        }
    }

    /// Adds the member (or extends its subscriptions) and rebalances the group.
    pub async fn join(
        &self,
        group_id: &str,
        member_id: &str,
        client_id: &str,
        topics: Vec<String>,
    ) -> BusResult<Vec<TopicPartition>> {
        let (group_id, member_id, client_id) =
            (group_id.to_string(), member_id.to_string(), client_id.to_string());
        self.call(|reply| CoordinatorMessage::Join {
            group_id,
            member_id,
            client_id,
            topics,
            reply,
        })
        .await
    }

    pub async fn leave(&self, group_id: &str, member_id: &str) -> BusResult<()> {
        let (group_id, member_id) = (group_id.to_string(), member_id.to_string());
        self.call(|reply| CoordinatorMessage::Leave {
            group_id,
            member_id,
            reply,
        })
        .await
    }

    /// Stores next-offset-to-read values. Callers pass `last processed + 1`.
    pub async fn commit(
        &self,
        group_id: &str,
        member_id: &str,
        offsets: Vec<(TopicPartition, i64)>,
    ) -> BusResult<()> {
        let (group_id, member_id) = (group_id.to_string(), member_id.to_string());
        self.call(|reply| CoordinatorMessage::Commit {
            group_id,
            member_id,
            offsets,
            reply,
        })
        .await
    }

    pub async fn restore(&self, snapshots: BTreeMap<String, OffsetSnapshot>) -> BusResult<usize> {
        self.call(|reply| CoordinatorMessage::Restore { snapshots, reply })
            .await
    }

    pub fn assignment(&self, group_id: &str, member_id: &str) -> Vec<TopicPartition> {
        read_groups(&self.cache)
            .get(group_id)
            .map(|group| group.assignment_for(member_id))
            .unwrap_or_default()
    }

    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        read_groups(&self.cache)
            .get(group_id)
            .and_then(|group| group.committed(tp))
    }

    pub fn group_info(&self, group_id: &str) -> BusResult<GroupInfo> {
        read_groups(&self.cache)
            .get(group_id)
            .map(ConsumerGroup::info)
            .ok_or_else(|| BusError::GroupNotFound(group_id.to_string()))
    }

    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read_groups(&self.cache).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}
