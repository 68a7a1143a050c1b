//! Chain replication state machine for one block.
//!
//! A [`ChainLink`] wraps the partition hosted by a block and knows where the
//! block sits in its replica chain. Mutators enter at the head, which numbers
//! them, applies them, buffers them as pending and forwards them. Every
//! following link does the same until the tail, which answers the client and
//! acknowledges upstream. An acknowledgment retires the pending entry at each
//! link it passes.
//!
//! # Ordering
//!
//! The head assigns `server_seq_no` and forwards under one async mutex, and
//! each edge is served by a single task, so every link applies mutators in
//! sequence order. Admission to the partition's table gate is obtained
//! before that mutex.
//!
//! # Replays
//!
//! After a repair a link may receive requests it already applied. Each link
//! remembers the highest sequence number it applied and skips local
//! execution of anything at or below it, while still forwarding or
//! acknowledging the request.

use crate::chain::clients::{ClientMap, Reply};
use crate::chain::subscription::{Notification, SubscriptionMap};
use crate::chain::transport::{ChainMessage, ChainTransport, ConnectionId, UpstreamHandle};
use crate::error::{Error, NetworkError, ProtocolError, Result};
use crate::metrics::LinkMetrics;
use crate::storage::hashtable::SlotMigrator;
use crate::storage::manager::StorageManager;
use crate::storage::partition::{AnyPartition, CommandKind, Partition, PartitionEvent};
use crate::types::{BlockId, ChainRole, ReplicaChain, Response, SequenceId, Status};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// A mutator forwarded downstream and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub seq: SequenceId,
    pub op_id: usize,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct NextLink {
    block: BlockId,
    conn: ConnectionId,
}

struct LinkState {
    path: String,
    chain: ReplicaChain,
    role: ChainRole,
    next: Option<NextLink>,
}

/// Background task applying acks from the downstream connection. Dropping
/// it stops the task.
struct AckListener {
    shutdown: Option<oneshot::Sender<()>>,
}

impl AckListener {
    fn spawn(link: Weak<ChainLink>, mut acks: mpsc::UnboundedReceiver<Bytes>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    frame = acks.recv() => {
                        let Some(frame) = frame else { break };
                        let Some(link) = link.upgrade() else { break };
                        match ChainMessage::decode(&frame) {
                            Ok(ChainMessage::Ack { seq }) => {
                                if let Err(e) = link.ack(seq) {
                                    warn!(block_id = link.block_id, seq = %seq, error = %e, "Failed to propagate ack");
                                }
                            }
                            Ok(other) => {
                                warn!(block_id = link.block_id, message = ?other, "Unexpected frame on ack stream");
                            }
                            Err(e) => {
                                warn!(block_id = link.block_id, error = %e, "Dropping undecodable ack");
                            }
                        }
                    }
                }
            }
            trace!("Ack listener stopped");
        });
        Self {
            shutdown: Some(shutdown_tx),
        }
    }
}

impl Drop for AckListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// One member of a replica chain.
pub struct ChainLink {
    block_id: BlockId,
    partition: AnyPartition,
    transport: Arc<dyn ChainTransport>,
    manager: Weak<StorageManager>,
    state: RwLock<LinkState>,
    prev: RwLock<Option<UpstreamHandle>>,
    pending: DashMap<i64, PendingRequest>,
    order: tokio::sync::Mutex<()>,
    server_seq: AtomicI64,
    applied_seq: AtomicI64,
    unheard_acks: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    listener: Mutex<Option<AckListener>>,
    clients: ClientMap,
    subscriptions: SubscriptionMap,
    alive: AtomicBool,
    metrics: LinkMetrics,
}

impl ChainLink {
    /// Wrap `partition` as a singleton chain. Call [`ChainLink::setup`] to
    /// place it in a real chain.
    pub fn new(
        block_id: BlockId,
        partition: AnyPartition,
        transport: Arc<dyn ChainTransport>,
        manager: Weak<StorageManager>,
    ) -> Arc<Self> {
        let chain = ReplicaChain::new(partition.name(), partition.metadata(), vec![block_id]);
        Arc::new(Self {
            block_id,
            partition,
            transport,
            manager,
            state: RwLock::new(LinkState {
                path: String::new(),
                chain,
                role: ChainRole::Singleton,
                next: None,
            }),
            prev: RwLock::new(None),
            pending: DashMap::new(),
            order: tokio::sync::Mutex::new(()),
            server_seq: AtomicI64::new(0),
            applied_seq: AtomicI64::new(0),
            unheard_acks: Mutex::new(None),
            listener: Mutex::new(None),
            clients: ClientMap::new(),
            subscriptions: SubscriptionMap::new(),
            alive: AtomicBool::new(true),
            metrics: LinkMetrics::new(),
        })
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn partition(&self) -> &AnyPartition {
        &self.partition
    }

    pub fn path(&self) -> String {
        self.state.read().path.clone()
    }

    pub fn chain(&self) -> ReplicaChain {
        self.state.read().chain.clone()
    }

    pub fn role(&self) -> ChainRole {
        self.state.read().role
    }

    pub fn next_block(&self) -> Option<BlockId> {
        self.state.read().next.map(|n| n.block)
    }

    pub fn prev_block(&self) -> Option<BlockId> {
        self.prev.read().as_ref().map(UpstreamHandle::block)
    }

    pub fn metrics(&self) -> &LinkMetrics {
        &self.metrics
    }

    pub fn transport(&self) -> &Arc<dyn ChainTransport> {
        &self.transport
    }

    /// Highest sequence number applied locally.
    pub fn applied_seq(&self) -> i64 {
        self.applied_seq.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending requests in sequence order.
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        let mut pending: Vec<_> = self.pending.iter().map(|e| e.value().clone()).collect();
        pending.sort_by_key(|p| p.seq.server_seq_no);
        pending
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Route replies for `client_id` to `tx`.
    pub fn register_client(&self, client_id: i64, tx: mpsc::UnboundedSender<Reply>) {
        self.clients.register(client_id, tx);
    }

    pub fn unregister_client(&self, client_id: i64) {
        self.clients.unregister(client_id);
    }

    /// Receive `(op, key)` notifications for the given commands. Only the
    /// tail publishes.
    pub fn subscribe(&self, ops: &[&str]) -> mpsc::UnboundedReceiver<Notification> {
        self.subscriptions.subscribe(ops)
    }

    /// Stop serving: every later request fails and the ack loop ends.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        self.listener.lock().take();
        self.unheard_acks.lock().take();
        debug!(block_id = self.block_id, "Link shut down");
    }

    pub(crate) fn set_prev(&self, prev: Option<UpstreamHandle>) {
        *self.prev.write() = prev;
    }

    /// Place the link in `chain` with the given role and successor.
    pub fn setup(
        self: &Arc<Self>,
        path: &str,
        chain: ReplicaChain,
        role: ChainRole,
        next: Option<BlockId>,
    ) -> Result<()> {
        {
            let mut state = self.state.write();
            state.path = path.to_string();
            state.chain = chain;
            state.role = role;
        }
        if role.is_head() {
            self.promote_to_head();
        }
        if role.is_tail() {
            self.reset_next(None)?;
        } else {
            self.reset_next_and_listen(next)?;
        }
        debug!(
            block_id = self.block_id,
            path = path,
            role = %role,
            next = ?next,
            "Link set up"
        );
        Ok(())
    }

    /// Adopt a repaired chain. A link whose successor changed reconnects and
    /// retransmits its pending requests; a link that became the tail retires
    /// them.
    pub async fn update_chain(self: &Arc<Self>, chain: ReplicaChain) -> Result<()> {
        let (role, next) = chain.position_of(self.block_id).ok_or_else(|| {
            Error::Internal(format!("block {} is not in chain {}", self.block_id, chain))
        })?;
        let old_next = self.next_block();
        let old_role = {
            let mut state = self.state.write();
            state.chain = chain;
            std::mem::replace(&mut state.role, role)
        };

        if role.is_head() {
            self.promote_to_head();
        }
        if role.is_tail() {
            if old_next.is_some() {
                self.reset_next(None)?;
            }
            let retired = self.retire_pending().await?;
            if retired > 0 {
                info!(block_id = self.block_id, retired, "Retired pending requests at new tail");
            }
        } else if old_next != next {
            self.reset_next_and_listen(next)?;
            self.resend_pending().await?;
        }

        info!(
            block_id = self.block_id,
            old_role = %old_role,
            role = %role,
            next = ?next,
            "Chain updated"
        );
        Ok(())
    }

    fn promote_to_head(&self) {
        self.set_prev(None);
        self.server_seq
            .fetch_max(self.applied_seq.load(Ordering::Acquire), Ordering::AcqRel);
    }

    /// Tear down the downstream connection and open one to `next`.
    pub fn reset_next(&self, next: Option<BlockId>) -> Result<()> {
        let old = self.state.write().next.take();
        if let Some(old) = old {
            self.transport.disconnect(old.conn);
        }
        self.listener.lock().take();
        self.unheard_acks.lock().take();

        let Some(block) = next else {
            return Ok(());
        };
        let conn = self.transport.connect(self.block_id, block)?;
        self.state.write().next = Some(NextLink {
            block,
            conn: conn.id,
        });
        *self.unheard_acks.lock() = Some(conn.acks);
        Ok(())
    }

    /// Like [`ChainLink::reset_next`], then consume acks from the new
    /// connection.
    pub fn reset_next_and_listen(self: &Arc<Self>, next: Option<BlockId>) -> Result<()> {
        self.reset_next(next)?;
        if let Some(acks) = self.unheard_acks.lock().take() {
            *self.listener.lock() = Some(AckListener::spawn(Arc::downgrade(self), acks));
        }
        Ok(())
    }

    fn next_conn(&self) -> Option<ConnectionId> {
        self.state.read().next.map(|n| n.conn)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(NetworkError::Unreachable(self.block_id).into())
        }
    }

    fn reject(&self, err: ProtocolError) -> Error {
        self.metrics.protocol_errors.inc();
        warn!(block_id = self.block_id, error = %err, "Rejected request");
        err.into()
    }

    /// Client entry point.
    ///
    /// Returns the response when this link answers directly (accessors at
    /// the tail, anything at a singleton). A mutator entering a longer chain
    /// returns `None`; the tail answers through the client's registration.
    pub async fn request(self: &Arc<Self>, seq: SequenceId, args: Vec<String>) -> Result<Option<Response>> {
        self.metrics.requests.inc();
        self.ensure_alive()?;
        let Some(command) = args.first() else {
            return Err(self.reject(ProtocolError::EmptyCommand));
        };

        let role = self.role();
        let kind = match (role, self.partition.command_kind(command)) {
            (ChainRole::Mid, _) => return Err(self.reject(ProtocolError::RequestAtMid(self.block_id))),
            (_, None) => return Ok(Some(Status::UnknownCommand.reply())),
            (ChainRole::Tail, Some(CommandKind::Mutator)) => {
                return Err(self.reject(ProtocolError::MutatorAtTail {
                    block: self.block_id,
                    op: command.clone(),
                }))
            }
            (ChainRole::Head, Some(CommandKind::Accessor)) => {
                return Err(self.reject(ProtocolError::AccessorAtHead {
                    block: self.block_id,
                    op: command.clone(),
                }))
            }
            (_, Some(kind)) => kind,
        };

        let admission = self.partition.admit(command).await;
        if kind == CommandKind::Accessor {
            let output = self.partition.run_command(&args, admission).await;
            return Ok(Some(output.response));
        }

        let _order = self.order.lock().await;
        let server_seq_no = self.server_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let seq = SequenceId {
            server_seq_no,
            ..seq
        };
        let output = self.partition.run_command(&args, admission).await;
        self.applied_seq.fetch_max(server_seq_no, Ordering::AcqRel);

        if role.is_tail() {
            self.after_apply(&args, output.event);
            return Ok(Some(output.response));
        }
        self.forward(seq, args)?;
        Ok(None)
    }

    /// Entry point for requests from the previous link.
    pub async fn chain_request(self: &Arc<Self>, seq: SequenceId, args: Vec<String>) -> Result<()> {
        self.metrics.chain_requests.inc();
        self.ensure_alive()?;

        let role = self.role();
        if role.is_head() {
            return Err(self.reject(ProtocolError::ChainRequestAtHead(self.block_id)));
        }
        let Some(command) = args.first() else {
            return Err(self.reject(ProtocolError::EmptyCommand));
        };
        match self.partition.command_kind(command) {
            Some(CommandKind::Mutator) => {}
            Some(CommandKind::Accessor) => {
                return Err(self.reject(ProtocolError::AccessorInChain {
                    block: self.block_id,
                    op: command.clone(),
                }))
            }
            None => return Err(self.reject(ProtocolError::UnknownCommand(command.clone()))),
        }

        let admission = if seq.server_seq_no <= self.applied_seq() {
            None
        } else {
            Some(self.partition.admit(command).await)
        };

        // Another connection may have applied this frame while it waited.
        let _order = self.order.lock().await;
        let admission = admission.filter(|_| seq.server_seq_no > self.applied_seq());
        let output = match admission {
            Some(admission) => {
                let output = self.partition.run_command(&args, admission).await;
                self.applied_seq.fetch_max(seq.server_seq_no, Ordering::AcqRel);
                Some(output)
            }
            None => {
                self.metrics.replays_skipped.inc();
                debug!(block_id = self.block_id, seq = %seq, "Skipping replayed request");
                None
            }
        };

        if role.is_tail() {
            if let Some(output) = output {
                self.clients.respond(seq, output.response);
                self.after_apply(&args, output.event);
            }
            return self.ack_upstream(seq);
        }
        self.forward(seq, args)
    }

    /// Retire `seq` and pass the ack upstream unless this is the head.
    pub fn ack(&self, seq: SequenceId) -> Result<()> {
        self.metrics.acks.inc();
        if self.pending.remove(&seq.server_seq_no).is_none() {
            trace!(block_id = self.block_id, seq = %seq, "Ack for unknown request");
        }
        self.metrics.pending.set(self.pending.len() as i64);
        if self.role().is_head() {
            return Ok(());
        }
        self.ack_upstream(seq)
    }

    /// Retransmit every pending request to the current successor in
    /// sequence order. Returns the number sent.
    pub async fn resend_pending(&self) -> Result<usize> {
        let _order = self.order.lock().await;
        let Some(conn) = self.next_conn() else {
            return Ok(0);
        };
        let pending = self.pending_requests();
        for request in &pending {
            self.transport.send(
                conn,
                &ChainMessage::Request {
                    seq: request.seq,
                    args: request.args.clone(),
                },
            )?;
            self.metrics.resent.inc();
        }
        if !pending.is_empty() {
            info!(
                block_id = self.block_id,
                count = pending.len(),
                next = ?self.next_block(),
                "Resent pending requests"
            );
        }
        Ok(pending.len())
    }

    /// Acknowledge and drop every pending request. Used when this link
    /// becomes the tail: everything it holds is committed.
    pub async fn retire_pending(&self) -> Result<usize> {
        let _order = self.order.lock().await;
        let pending = self.pending_requests();
        let is_head = self.role().is_head();
        for request in &pending {
            self.pending.remove(&request.seq.server_seq_no);
            if !is_head {
                self.ack_upstream(request.seq)?;
            }
        }
        self.metrics.pending.set(self.pending.len() as i64);
        Ok(pending.len())
    }

    fn forward(&self, seq: SequenceId, args: Vec<String>) -> Result<()> {
        let op_id = self
            .partition
            .commands()
            .id(&args[0])
            .unwrap_or_default();
        self.pending.insert(
            seq.server_seq_no,
            PendingRequest {
                seq,
                op_id,
                args: args.clone(),
            },
        );
        self.metrics.pending.set(self.pending.len() as i64);

        let conn = self
            .next_conn()
            .ok_or(NetworkError::NoNextLink(self.block_id))?;
        self.transport.send(conn, &ChainMessage::Request { seq, args })?;
        self.metrics.forwarded.inc();
        trace!(block_id = self.block_id, seq = %seq, "Forwarded request");
        Ok(())
    }

    fn ack_upstream(&self, seq: SequenceId) -> Result<()> {
        let prev = self.prev.read().clone();
        match prev {
            Some(prev) => prev.ack(seq),
            None => {
                debug!(block_id = self.block_id, seq = %seq, "No upstream link to ack");
                Ok(())
            }
        }
    }

    /// Tail-side follow-up of an applied mutator.
    fn after_apply(self: &Arc<Self>, args: &[String], event: Option<PartitionEvent>) {
        if let (Some(op), Some(key)) = (args.first(), args.get(1)) {
            self.subscriptions.notify(op, key);
        }
        if let Some(event) = event {
            self.handle_event(event);
        }
    }

    fn handle_event(self: &Arc<Self>, event: PartitionEvent) {
        let Some(store) = self.partition.as_hash_table().cloned() else {
            return;
        };
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let directory = match manager.directory() {
            Ok(directory) => directory,
            Err(e) => {
                warn!(block_id = self.block_id, error = %e, event = ?event, "Cannot handle partition event");
                return;
            }
        };

        match event {
            PartitionEvent::Overloaded | PartitionEvent::Underloaded => {
                if !store.migration_token().try_acquire() {
                    debug!(block_id = self.block_id, "Slot migration already running");
                    return;
                }
                let migrator = SlotMigrator::new(
                    Arc::clone(self),
                    store,
                    directory,
                    manager.config().client.clone(),
                );
                if event == PartitionEvent::Overloaded {
                    tokio::spawn(migrator.split());
                } else {
                    tokio::spawn(migrator.merge());
                }
            }
            PartitionEvent::ImportFinished { source } => {
                let path = self.path();
                let block_id = self.block_id;
                tokio::spawn(async move {
                    match directory.remove_block(&path, &source).await {
                        Ok(()) => info!(block_id, path = %path, source = %source, "Removed merged partition"),
                        Err(e) => warn!(block_id, path = %path, source = %source, error = %e, "Failed to remove merged partition"),
                    }
                });
            }
        }
    }
}

impl fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ChainLink")
            .field("block_id", &self.block_id)
            .field("role", &state.role)
            .field("chain", &state.chain.block_ids)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Drop for ChainLink {
    fn drop(&mut self) {
        if let Some(next) = self.state.get_mut().next.take() {
            self.transport.disconnect(next.conn);
        }
    }
}
