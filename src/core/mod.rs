//! The runtime half of a Raft node.
//!
//! [`Raft`] is the public handle; the work happens in a spawned `RaftCore`
//! task which consumes one serialized event stream. Every event goes through
//! the engine, and the resulting [`Outcome`] is applied in a fixed order:
//! hard state is persisted first, then the log changes, then volatile state,
//! then timers and shipping, and only then are outbound messages handed to
//! spawned send tasks. An engine or apply error before the persist leaves the
//! node untouched; a storage failure marks the node unhealthy and it refuses
//! all further participation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::info_span;
use tracing::warn;
use tracing_futures::Instrument;

use crate::batch;
use crate::config::Config;
use crate::engine::Engine;
use crate::engine::Input;
use crate::engine::LeaderContext;
use crate::engine::LogDirective;
use crate::engine::Outcome;
use crate::engine::RaftState;
use crate::engine::Role;
use crate::engine::ShippingDirective;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::ChangeResponder;
use crate::membership::MembershipAction;
use crate::membership::MembershipManager;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::message::MembershipConfig;
use crate::message::Message;
use crate::message::NewEntryRequest;
use crate::metrics::NodeHealth;
use crate::metrics::RaftMetrics;
use crate::network::RaftNetwork;
use crate::replication::LogShippingManager;
use crate::storage::HardState;
use crate::storage::RaftLog;
use crate::storage::StateStore;
use crate::timeout::TimeoutHandle;
use crate::timeout::TimeoutName;
use crate::timeout::TimeoutService;
use crate::types::ClusterId;
use crate::types::LogId;
use crate::types::Update;
use crate::AppData;
use crate::NodeId;

/// One event for the core task, either off the wire or internal.
#[derive(Debug)]
pub(crate) enum RaftEvent<D: AppData> {
    Message(Message<D>),
    ElectionTimeout,
    HeartbeatTimeout,
    Initialize {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<RaftResult<()>>,
    },
    ChangeMembership {
        members: BTreeSet<NodeId>,
        tx: ChangeResponder,
    },
    Shutdown,
}

/// The Raft API.
///
/// This handle is cheap to use from many tasks; all methods funnel into the
/// node's serialized event stream. Dropping the handle does not stop the
/// node; call [`Raft::shutdown`] for that.
pub struct Raft<D: AppData> {
    id: NodeId,
    cluster: ClusterId,
    config: Arc<Config>,
    in_tx: mpsc::Sender<RaftEvent<D>>,
    metrics_rx: watch::Receiver<RaftMetrics>,
    commit_rx: watch::Receiver<u64>,
    core_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<D: AppData> Raft<D> {
    /// Create and start a new Raft node.
    ///
    /// Must be called from within a tokio runtime; this spawns the core task,
    /// the inbound batcher and the timeout driver. The node starts as a
    /// follower and, when its persisted membership includes itself, arms an
    /// election timeout immediately.
    pub fn new<N, L, S>(
        id: NodeId,
        cluster: ClusterId,
        config: Config,
        network: Arc<N>,
        log: L,
        state_store: S,
    ) -> RaftResult<Self>
    where
        N: RaftNetwork<D>,
        L: RaftLog<D>,
        S: StateStore,
    {
        let config = Arc::new(config);
        let hs = state_store.load()?.unwrap_or_default();
        let last_log_index = log.append_index();
        let last_log_term = log.term_at(last_log_index)?.unwrap_or(0);
        let state = RaftState {
            id,
            cluster,
            current_term: hs.current_term,
            voted_for: hs.voted_for,
            leader: None,
            commit_index: log.commit_index(),
            last_log_index,
            last_log_term,
            membership: hs.membership,
        };

        let (in_tx, in_rx) = mpsc::channel(config.inbound_queue_capacity);
        let (core_tx, core_rx) = mpsc::channel(config.inbound_queue_capacity);
        tokio::spawn(
            batch::run(in_rx, core_tx, config.max_batch_size, config.batch_wait)
                .instrument(info_span!("batcher", id)),
        );

        let (metrics_tx, metrics_rx) = watch::channel(RaftMetrics::new_initial(id));
        let (commit_tx, commit_rx) = watch::channel(state.commit_index);
        let core = RaftCore {
            id,
            cluster,
            config: config.clone(),
            engine: Engine::new(state, Role::Follower),
            log,
            state_store,
            network,
            shipping: LogShippingManager::new(id, cluster, config.max_payload_entries, config.max_inflight_entries),
            membership: MembershipManager::new(config.catch_up_lag, config.catch_up_timeout),
            rx: core_rx,
            in_tx: in_tx.clone(),
            timeouts: TimeoutService::spawn(),
            election_timer: None,
            heartbeat_timer: None,
            metrics_tx,
            commit_tx,
            health: NodeHealth::Healthy,
        };
        let core_handle = tokio::spawn(core.run().instrument(info_span!("raft-core", id)));

        Ok(Self {
            id,
            cluster,
            config,
            in_tx,
            metrics_rx,
            commit_rx,
            core_handle: std::sync::Mutex::new(Some(core_handle)),
        })
    }

    /// The ID of this node.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Submit an inbound message from the transport.
    ///
    /// A message stamped with a foreign cluster token is dropped here, before
    /// it can reach the state machine. Awaits queue capacity; inbound
    /// pressure propagates to the transport rather than dropping messages.
    pub async fn handle_message(&self, msg: Message<D>) -> RaftResult<()> {
        if msg.cluster() != self.cluster {
            warn!(got = %msg.cluster(), expected = %self.cluster, kind = msg.summary(), "dropping cross-cluster message");
            return Ok(());
        }
        self.in_tx
            .send(RaftEvent::Message(msg))
            .await
            .map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit a new entry to be replicated.
    ///
    /// Returns once the entry is handed off to the node, not once it commits;
    /// observe commitment through [`Raft::notify_committed`]. When no leader
    /// is known within the configured wait, the retryable
    /// [`ClientWriteError::NoLeader`] is returned.
    pub async fn client_write(&self, content: D) -> Result<(), ClientWriteError> {
        let mut metrics = self.metrics_rx.clone();
        let leader_known = async {
            loop {
                if metrics.borrow().current_leader.is_some() {
                    return;
                }
                if metrics.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(self.config.leader_wait, leader_known).await.is_err() {
            let last_known = self.metrics_rx.borrow().current_leader;
            return Err(ClientWriteError::NoLeader(last_known));
        }

        self.in_tx
            .send(RaftEvent::Message(Message::NewEntry(NewEntryRequest {
                cluster: self.cluster,
                content,
            })))
            .await
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))
    }

    /// Bootstrap a pristine node with an initial voting membership.
    ///
    /// On a node whose log or term is no longer pristine this is a no-op;
    /// bootstrap results flow from the first election instead.
    pub async fn initialize(&self, members: BTreeSet<NodeId>) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.in_tx
            .send(RaftEvent::Initialize { members, tx })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Propose moving the voting membership to `members`.
    ///
    /// Resolves once the change is finalized and committed, or with the
    /// reason it could not be.
    pub async fn change_membership(&self, members: BTreeSet<NodeId>) -> Result<(), ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.in_tx
            .send(RaftEvent::ChangeMembership { members, tx })
            .await
            .map_err(|_| ChangeMembershipError::RaftError(RaftError::ShuttingDown))?;
        rx.await
            .map_err(|_| ChangeMembershipError::RaftError(RaftError::ShuttingDown))?
    }

    /// A watch of this node's metrics, updated after every applied event.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.metrics_rx.clone()
    }

    /// A watch of the node's commit index, for observing entry commitment.
    pub fn notify_committed(&self) -> watch::Receiver<u64> {
        self.commit_rx.clone()
    }

    /// Stop the node and wait for its core task to exit.
    pub async fn shutdown(&self) -> RaftResult<()> {
        let _ = self.in_tx.send(RaftEvent::Shutdown).await;
        let handle = self.core_handle.lock().map(|mut guard| guard.take()).unwrap_or(None);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

struct RaftCore<D, N, L, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    L: RaftLog<D>,
    S: StateStore,
{
    id: NodeId,
    cluster: ClusterId,
    config: Arc<Config>,
    engine: Engine,
    log: L,
    state_store: S,
    network: Arc<N>,
    shipping: LogShippingManager,
    membership: MembershipManager,
    rx: mpsc::Receiver<RaftEvent<D>>,
    in_tx: mpsc::Sender<RaftEvent<D>>,
    timeouts: TimeoutService,
    election_timer: Option<TimeoutHandle>,
    heartbeat_timer: Option<TimeoutHandle>,
    metrics_tx: watch::Sender<RaftMetrics>,
    commit_tx: watch::Sender<u64>,
    health: NodeHealth,
}

impl<D, N, L, S> RaftCore<D, N, L, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    L: RaftLog<D>,
    S: StateStore,
{
    async fn run(mut self) {
        info!(cluster = %self.cluster, "Raft node starting");
        // A member of its own cluster is immediately election-eligible; a
        // pristine node stays quiet until initialized.
        if self.engine.state.membership.contains(&self.id) {
            self.arm_election_timer();
        }
        self.publish_metrics();

        while let Some(event) = self.rx.recv().await {
            match event {
                RaftEvent::Shutdown => {
                    info!("shutdown requested");
                    break;
                }
                RaftEvent::Message(msg) => self.process(Input::Message(msg)),
                RaftEvent::ElectionTimeout => self.process(Input::ElectionTimeout),
                RaftEvent::HeartbeatTimeout => self.process(Input::HeartbeatTimeout),
                RaftEvent::Initialize { members, tx } => {
                    let res = self.initialize(members);
                    if let Err(err @ RaftError::RaftStorage(_)) = &res {
                        self.mark_unhealthy(err);
                    }
                    let _ = tx.send(res);
                }
                RaftEvent::ChangeMembership { members, tx } => self.change_membership(members, tx),
            }
        }
        self.election_timer = None;
        self.heartbeat_timer = None;
        self.membership.abandon(ChangeMembershipError::RaftError(RaftError::ShuttingDown));
        info!("Raft node stopped");
    }

    /// Run one event through the engine, apply the outcome, then drive any
    /// membership-change follow-up it unlocked.
    fn process(&mut self, input: Input<D>) {
        self.handle_engine(input);
        self.drive_membership();
    }

    /// Step the in-flight membership change as far as fresh commit and
    /// replication state allow.
    fn drive_membership(&mut self) {
        loop {
            if self.engine.role != Role::Leader {
                break;
            }
            let action = self.membership.poll(
                self.engine.state.commit_index,
                self.engine.state.last_log_index,
                &self.shipping.progress(),
                Instant::now(),
            );
            match action {
                Some(MembershipAction::Finalize) => {
                    self.handle_engine(Input::FinalizeMembership);
                    self.membership.note_finalize_appended(self.engine.state.last_log_index);
                }
                Some(MembershipAction::Abort) => {
                    self.handle_engine(Input::AbortMembership);
                    self.membership.note_abort_appended(self.engine.state.last_log_index);
                }
                Some(MembershipAction::Completed) => {
                    self.shipping
                        .retain_targets(&self.engine.state.membership.all_targets(), self.engine.state.last_log_index);
                    if !self.engine.state.membership.voting.contains(&self.id) {
                        info!("removed from the voting set, stepping down");
                        self.step_down_removed();
                        break;
                    }
                }
                None => break,
            }
        }
    }

    fn handle_engine(&mut self, input: Input<D>) {
        if self.health == NodeHealth::Unhealthy {
            debug!("unhealthy node ignoring event");
            return;
        }
        let progress = self.shipping.progress();
        match self.engine.handle(input, &progress, &self.log) {
            Ok(outcome) => {
                if let Err(err) = self.apply(outcome) {
                    self.mark_unhealthy(&err);
                }
            }
            Err(err) => error!(error = %err, "engine refused the event"),
        }
        self.publish_metrics();
    }

    /// Apply one outcome. Hard state is persisted before any other effect
    /// takes hold; a storage error anywhere aborts the node.
    fn apply(&mut self, outcome: Outcome<D>) -> RaftResult<()> {
        let prior_last = self.engine.state.last_log_index;

        // (1) durable promises first
        let term = match outcome.term {
            Update::Update(term) => term,
            Update::Ignore => self.engine.state.current_term,
        };
        let voted_for = match outcome.voted_for {
            Update::Update(v) => v,
            Update::Ignore => self.engine.state.voted_for,
        };
        let membership = match &outcome.membership {
            Update::Update(m) => m.clone(),
            Update::Ignore => self.engine.state.membership.clone(),
        };
        if outcome.changes_hard_state() {
            self.state_store.persist(&HardState {
                current_term: term,
                voted_for,
                membership: membership.clone(),
            })?;
        }

        // (2) the log
        for directive in outcome.log {
            match directive {
                LogDirective::TruncateFrom { from } => self.log.truncate(from)?,
                LogDirective::Append { entries } => {
                    for entry in entries {
                        self.log.append(entry)?;
                    }
                }
            }
        }
        let mut committed = None;
        if let Some(commit) = outcome.commit_to {
            if commit > self.engine.state.commit_index {
                self.log.commit(commit)?;
                committed = Some(commit);
            }
        }

        // (3) volatile state
        let state = &mut self.engine.state;
        state.current_term = term;
        state.voted_for = voted_for;
        let membership_changed = !outcome.membership.is_ignore();
        state.membership = membership;
        if let Update::Update(leader) = outcome.leader {
            state.leader = leader;
        }
        if let Some(commit) = committed {
            state.commit_index = commit;
        }
        state.last_log_index = self.log.append_index();
        state.last_log_term = self.log.term_at(state.last_log_index)?.unwrap_or(0);

        // (4) role transitions drive timers and shipping lifecycle
        if let Some(role) = outcome.next_role {
            self.transition(role, prior_last);
        }
        if membership_changed && self.shipping.is_active() {
            self.shipping
                .retain_targets(&self.engine.state.membership.all_targets(), self.engine.state.last_log_index);
        }

        // (5) shipping
        let mut outbound = outcome.send;
        for directive in outcome.shipping {
            match directive {
                ShippingDirective::UpdateContext { context } => self.shipping.set_context(context),
                ShippingDirective::Appended { last_index } => {
                    outbound.extend(self.shipping.on_appended(last_index, &self.log)?)
                }
                ShippingDirective::Progress {
                    follower,
                    success,
                    match_index,
                    append_index,
                } => outbound.extend(self.shipping.on_progress(follower, success, match_index, append_index, &self.log)?),
            }
        }

        // (6) timers
        if outcome.renew_election_timer {
            self.arm_election_timer();
        }
        if outcome.renew_heartbeat_timer {
            self.arm_heartbeat_timer();
        }

        // (7) notify and send, outside the critical section
        if let Some(commit) = committed {
            self.commit_tx.send_replace(commit);
        }
        self.dispatch(outbound);
        Ok(())
    }

    fn transition(&mut self, role: Role, prior_last: u64) {
        let was_leader = self.engine.role == Role::Leader;
        let is_leader = role == Role::Leader;
        debug!(from = ?self.engine.role.tag(), to = ?role.tag(), "role transition");
        self.engine.role = role;

        if is_leader && !was_leader {
            let state = &self.engine.state;
            self.shipping.start(
                LeaderContext {
                    term: state.current_term,
                    commit_index: state.commit_index,
                },
                &state.membership.all_targets(),
                prior_last,
            );
            // A joint config inherited from a deposed leader must still be
            // driven to its finalize or abort entry; committing this leader's
            // barrier entry commits the joint entry as its prefix.
            if state.membership.in_transition() && !self.membership.in_progress() {
                let joiners: BTreeSet<NodeId> = state
                    .membership
                    .target
                    .as_ref()
                    .map(|t| t.difference(&state.membership.voting).copied().collect())
                    .unwrap_or_default();
                let barrier = state.last_log_index;
                info!(?joiners, "inherited an unfinished membership change, resuming it");
                self.membership.resume(joiners, barrier, Instant::now());
            }
            self.election_timer = None;
            self.arm_heartbeat_timer();
        }
        if was_leader && !is_leader {
            self.shipping.stop();
            self.heartbeat_timer = None;
            self.membership
                .abandon(ChangeMembershipError::NotLeader(self.engine.state.leader));
            self.arm_election_timer();
        }
    }

    /// This node finalized its own removal from the voting set. It stays a
    /// live non-voter so it can still serve reads, but leads no more.
    fn step_down_removed(&mut self) {
        self.engine.role = Role::Follower;
        self.engine.state.leader = None;
        self.shipping.stop();
        self.heartbeat_timer = None;
        self.election_timer = None;
        self.publish_metrics();
    }

    fn initialize(&mut self, members: BTreeSet<NodeId>) -> RaftResult<()> {
        if self.health == NodeHealth::Unhealthy {
            return Err(RaftError::Unhealthy);
        }
        if self.engine.state.last_log_index > 0 || self.engine.state.current_term > 0 {
            debug!("initialize on a non-pristine node is a no-op");
            return Ok(());
        }
        info!(?members, "initializing pristine node");
        let config = MembershipConfig {
            voting: members,
            target: None,
        };
        self.state_store.persist(&HardState {
            current_term: 0,
            voted_for: None,
            membership: config.clone(),
        })?;
        self.log.append(Entry {
            log_id: LogId::new(0, 1),
            payload: EntryPayload::<D>::Membership(config.clone()),
        })?;
        self.engine.state.membership = config;
        self.engine.state.last_log_index = 1;
        self.engine.state.last_log_term = 0;
        if self.engine.state.membership.contains(&self.id) {
            self.arm_election_timer();
        }
        self.publish_metrics();
        Ok(())
    }

    fn change_membership(&mut self, members: BTreeSet<NodeId>, tx: ChangeResponder) {
        if self.health == NodeHealth::Unhealthy {
            let _ = tx.send(Err(ChangeMembershipError::RaftError(RaftError::Unhealthy)));
            return;
        }
        if self.engine.role != Role::Leader {
            let _ = tx.send(Err(ChangeMembershipError::NotLeader(self.engine.state.leader)));
            return;
        }
        if members.is_empty() {
            let _ = tx.send(Err(ChangeMembershipError::EmptyMembership));
            return;
        }
        if self.membership.in_progress() || self.engine.state.membership.in_transition() {
            let _ = tx.send(Err(ChangeMembershipError::InProgress));
            return;
        }

        let joiners: BTreeSet<NodeId> = members.difference(&self.engine.state.membership.voting).copied().collect();
        self.handle_engine(Input::ChangeMembership { members });
        if self.health == NodeHealth::Unhealthy {
            let _ = tx.send(Err(ChangeMembershipError::RaftError(RaftError::Unhealthy)));
            return;
        }
        self.membership
            .begin(tx, joiners, self.engine.state.last_log_index, Instant::now());
        // A sole-voter leader may have committed the joint entry on append.
        self.drive_membership();
    }

    /// Hand outbound messages to a send task; the core never blocks on the
    /// transport.
    fn dispatch(&self, outbound: Vec<(NodeId, Message<D>)>) {
        if outbound.is_empty() {
            return;
        }
        let network = self.network.clone();
        tokio::spawn(
            async move {
                for (target, msg) in outbound {
                    network.send(target, msg).await;
                }
            }
            .instrument(info_span!("send", id = self.id)),
        );
    }

    fn arm_election_timer(&mut self) {
        match &self.election_timer {
            Some(timer) => timer.renew(),
            None => {
                let tx = self.in_tx.clone();
                self.election_timer = Some(self.timeouts.create(
                    TimeoutName::Election,
                    self.config.election_delay(),
                    self.config.election_jitter(),
                    move || enqueue(&tx, RaftEvent::ElectionTimeout),
                ));
            }
        }
    }

    fn arm_heartbeat_timer(&mut self) {
        match &self.heartbeat_timer {
            Some(timer) => timer.renew(),
            None => {
                let tx = self.in_tx.clone();
                self.heartbeat_timer = Some(self.timeouts.create(
                    TimeoutName::Heartbeat,
                    self.config.heartbeat_delay(),
                    std::time::Duration::ZERO,
                    move || enqueue(&tx, RaftEvent::HeartbeatTimeout),
                ));
            }
        }
    }

    fn mark_unhealthy(&mut self, err: &RaftError) {
        error!(error = %err, "fatal storage failure, node refuses further participation");
        self.health = NodeHealth::Unhealthy;
        self.election_timer = None;
        self.heartbeat_timer = None;
        self.shipping.stop();
        self.membership.abandon(ChangeMembershipError::RaftError(RaftError::Unhealthy));
    }

    fn publish_metrics(&self) {
        let state = &self.engine.state;
        self.metrics_tx.send_replace(RaftMetrics {
            id: self.id,
            health: self.health,
            role: self.engine.role.tag(),
            current_term: state.current_term,
            last_log_index: state.last_log_index,
            commit_index: state.commit_index,
            current_leader: state.leader,
            membership_config: state.membership.clone(),
        });
    }
}

/// Enqueue an internal event from a non-async context, falling back to a
/// spawned send when the queue is momentarily full.
fn enqueue<D: AppData>(tx: &mpsc::Sender<RaftEvent<D>>, event: RaftEvent<D>) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }
}
