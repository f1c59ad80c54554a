//! Distributed (XA-style) transactions.
//!
//! Branches are identified by a global transaction id (Xid) and live in the
//! address-space-wide `DtxRegistry`. A session participates through a
//! `DistributedTransaction` bound by `select_dtx`; branch lifecycle is
//! `start -> [suspend/resume] -> end -> prepare -> commit|rollback`, with
//! `forget` reserved for heuristic outcomes. Branch timeouts are advisory
//! and observed by polling; an expired branch is marked rollback-only.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use super::{PendingOp, Transaction, TxnAction, TxnError, TxnKind};
use crate::core::time::Clock;
use crate::ops::audit;
use crate::store::{EnqueueRecord, MessageHandle, MessageStore, StoreOp};

/// Global transaction identifier of a dtx branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: u32,
    pub global_id: Vec<u8>,
    pub branch_id: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: u32, global_id: Vec<u8>, branch_id: Vec<u8>) -> Self {
        Self {
            format_id,
            global_id,
            branch_id,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.format_id,
            hex(&self.global_id),
            hex(&self.branch_id)
        )
    }
}

/// Branch lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    /// At least one session is actively working in the branch.
    Active,
    /// All working sessions are suspended.
    Suspended,
    /// Work ended; the branch awaits prepare, one-phase commit or rollback.
    Ended,
    /// Phase one complete; the branch awaits commit or rollback.
    Prepared,
    /// The branch may only be rolled back (failed end, or timed out).
    RollbackOnly,
    /// Heuristically committed; awaiting forget.
    HeurCommitted,
    /// Heuristically rolled back; awaiting forget.
    HeurRolledBack,
}

impl BranchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchState::Active => "active",
            BranchState::Suspended => "suspended",
            BranchState::Ended => "ended",
            BranchState::Prepared => "prepared",
            BranchState::RollbackOnly => "rollback_only",
            BranchState::HeurCommitted => "heur_committed",
            BranchState::HeurRolledBack => "heur_rolled_back",
        }
    }

    pub fn is_heuristic(&self) -> bool {
        matches!(self, BranchState::HeurCommitted | BranchState::HeurRolledBack)
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-state failures of the dtx verb surface. None are retried by the
/// engine; the framing layer maps them to protocol error responses.
#[derive(Debug, PartialEq, Error)]
pub enum DtxError {
    #[error("no distributed transaction is selected on this session")]
    NotSelected,
    #[error("unknown dtx branch {0}")]
    UnknownBranch(Xid),
    #[error("dtx branch {0} is already known")]
    AlreadyKnown(Xid),
    #[error("dtx branch {0} is not associated with this session")]
    NotAssociated(Xid),
    #[error("dtx branch {0} has exceeded its timeout and is marked rollback-only")]
    Timeout(Xid),
    #[error("dtx branch {0} is marked rollback-only")]
    RollbackOnly(Xid),
    #[error("cannot both join and resume dtx branch {0}")]
    JoinAndResume(Xid),
    #[error("cannot both suspend and fail dtx branch {0}")]
    SuspendAndFail(Xid),
    #[error("a dtx branch ({0}) is already active on this session")]
    BranchActive(Xid),
    #[error("transaction work arrived with no active dtx branch")]
    NoActiveBranch,
    #[error("dtx branch {xid} is in state {state}; {operation} is not permitted")]
    IncorrectState {
        xid: Xid,
        state: BranchState,
        operation: &'static str,
    },
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

struct DtxBranch {
    state: BranchState,
    ops: Vec<PendingOp>,
    /// Sessions actively working in the branch.
    associations: HashSet<Uuid>,
    /// Sessions that suspended their association.
    suspended: HashSet<Uuid>,
    timeout: Option<Duration>,
    expires_at: Option<Instant>,
    started_at: Instant,
    updated_at: Instant,
}

impl DtxBranch {
    fn new(now: Instant, timeout: Option<Duration>) -> Self {
        Self {
            state: BranchState::Active,
            ops: Vec::new(),
            associations: HashSet::new(),
            suspended: HashSet::new(),
            timeout,
            expires_at: timeout.map(|t| now + t),
            started_at: now,
            updated_at: now,
        }
    }

    /// Observe expiry: an expired, still-settleable branch becomes
    /// rollback-only. Returns whether expiry was observed now.
    fn observe_expiry(&mut self, xid: &Xid, now: Instant) -> bool {
        let expired = matches!(self.expires_at, Some(at) if now > at);
        if expired
            && !matches!(
                self.state,
                BranchState::RollbackOnly | BranchState::HeurCommitted | BranchState::HeurRolledBack
            )
        {
            self.state = BranchState::RollbackOnly;
            audit::emit(
                audit::DTX_TIMEOUT,
                &xid.to_string(),
                "branch expired; marked rollback-only",
            );
            return true;
        }
        expired
    }
}

/// Address-space-wide registry of dtx branches.
pub struct DtxRegistry {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    default_timeout: Option<Duration>,
    max_timeout: Option<Duration>,
    branches: Mutex<HashMap<Xid, DtxBranch>>,
}

impl DtxRegistry {
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        default_timeout: Option<Duration>,
        max_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            clock,
            default_timeout,
            max_timeout,
            branches: Mutex::new(HashMap::new()),
        }
    }

    /// Associate a session with a branch, creating it unless joining or
    /// resuming an existing one.
    pub fn start(
        &self,
        session: Uuid,
        xid: &Xid,
        join: bool,
        resume: bool,
    ) -> Result<(), DtxError> {
        if join && resume {
            return Err(DtxError::JoinAndResume(xid.clone()));
        }
        let now = self.clock.now();
        let mut branches = self.branches.lock();
        match branches.get_mut(xid) {
            Some(branch) => {
                if resume {
                    if !branch.suspended.remove(&session) {
                        return Err(DtxError::NotAssociated(xid.clone()));
                    }
                    branch.associations.insert(session);
                    branch.state = BranchState::Active;
                    branch.updated_at = now;
                    Ok(())
                } else if join {
                    if !matches!(branch.state, BranchState::Active | BranchState::Suspended) {
                        return Err(DtxError::IncorrectState {
                            xid: xid.clone(),
                            state: branch.state,
                            operation: "join",
                        });
                    }
                    branch.associations.insert(session);
                    branch.state = BranchState::Active;
                    branch.updated_at = now;
                    Ok(())
                } else {
                    Err(DtxError::AlreadyKnown(xid.clone()))
                }
            }
            None => {
                if join || resume {
                    return Err(DtxError::UnknownBranch(xid.clone()));
                }
                let mut branch = DtxBranch::new(now, self.default_timeout);
                branch.associations.insert(session);
                branches.insert(xid.clone(), branch);
                Ok(())
            }
        }
    }

    /// End a session's association with a branch.
    pub fn end(
        &self,
        session: Uuid,
        xid: &Xid,
        fail: bool,
        suspend: bool,
    ) -> Result<(), DtxError> {
        if suspend && fail {
            return Err(DtxError::SuspendAndFail(xid.clone()));
        }
        let now = self.clock.now();
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(xid)
            .ok_or_else(|| DtxError::UnknownBranch(xid.clone()))?;
        if !branch.associations.contains(&session) {
            return Err(DtxError::NotAssociated(xid.clone()));
        }
        branch.updated_at = now;
        if branch.observe_expiry(xid, now) {
            branch.associations.remove(&session);
            return Err(DtxError::Timeout(xid.clone()));
        }
        if fail {
            branch.associations.remove(&session);
            branch.state = BranchState::RollbackOnly;
            return Ok(());
        }
        if suspend {
            branch.associations.remove(&session);
            branch.suspended.insert(session);
            if branch.associations.is_empty() {
                branch.state = BranchState::Suspended;
            }
            return Ok(());
        }
        branch.associations.remove(&session);
        if branch.associations.is_empty() && branch.state == BranchState::Active {
            branch.state = BranchState::Ended;
        }
        Ok(())
    }

    /// Phase one of two-phase commit.
    pub fn prepare(&self, xid: &Xid) -> Result<(), DtxError> {
        let now = self.clock.now();
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(xid)
            .ok_or_else(|| DtxError::UnknownBranch(xid.clone()))?;
        if branch.observe_expiry(xid, now) {
            return Err(DtxError::Timeout(xid.clone()));
        }
        if branch.state == BranchState::RollbackOnly {
            return Err(DtxError::RollbackOnly(xid.clone()));
        }
        if branch.state != BranchState::Ended || !branch.associations.is_empty() {
            return Err(DtxError::IncorrectState {
                xid: xid.clone(),
                state: branch.state,
                operation: "prepare",
            });
        }
        branch.state = BranchState::Prepared;
        branch.updated_at = now;
        Ok(())
    }

    /// Commit a branch: one-phase from `Ended`, two-phase from `Prepared`.
    ///
    /// A store failure after prepare leaves a heuristic outcome; the branch
    /// survives for `forget`.
    pub fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), DtxError> {
        let now = self.clock.now();
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(xid)
            .ok_or_else(|| DtxError::UnknownBranch(xid.clone()))?;
        if branch.observe_expiry(xid, now) {
            return Err(DtxError::Timeout(xid.clone()));
        }
        if branch.state == BranchState::RollbackOnly {
            return Err(DtxError::RollbackOnly(xid.clone()));
        }
        if !branch.associations.is_empty() {
            return Err(DtxError::IncorrectState {
                xid: xid.clone(),
                state: branch.state,
                operation: "commit",
            });
        }
        let expected = if one_phase {
            BranchState::Ended
        } else {
            BranchState::Prepared
        };
        if branch.state != expected {
            return Err(DtxError::IncorrectState {
                xid: xid.clone(),
                state: branch.state,
                operation: if one_phase { "commit(one-phase)" } else { "commit" },
            });
        }

        let was_prepared = branch.state == BranchState::Prepared;
        let mut branch = branches.remove(xid).expect("branch present");
        drop(branches);

        let mut tx = self.store.begin();
        for op in &branch.ops {
            match &op.store_op {
                Some(StoreOp::Enqueue { queue, message_id }) => tx.enqueue(queue, *message_id),
                Some(StoreOp::Dequeue { queue, message_id }) => tx.dequeue(queue, *message_id),
                None => {}
            }
        }
        match tx.commit() {
            Ok(()) => {
                for op in branch.ops {
                    op.action.post_commit();
                }
                Ok(())
            }
            Err(err) => {
                let ops = std::mem::take(&mut branch.ops);
                if was_prepared {
                    // Outcome diverged from the coordinator's decision:
                    // record a heuristic rollback and keep the branch shell
                    // around until the coordinator forgets it.
                    branch.state = BranchState::HeurRolledBack;
                    self.branches.lock().insert(xid.clone(), branch);
                }
                for op in ops {
                    op.action.on_rollback();
                }
                Err(err.into())
            }
        }
    }

    /// Roll back a branch, discarding its operations.
    pub fn rollback(&self, xid: &Xid) -> Result<(), DtxError> {
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(xid)
            .ok_or_else(|| DtxError::UnknownBranch(xid.clone()))?;
        if branch.state.is_heuristic() {
            return Err(DtxError::IncorrectState {
                xid: xid.clone(),
                state: branch.state,
                operation: "rollback",
            });
        }
        if !branch.associations.is_empty() {
            return Err(DtxError::IncorrectState {
                xid: xid.clone(),
                state: branch.state,
                operation: "rollback",
            });
        }
        let branch = branches.remove(xid).expect("branch present");
        drop(branches);
        for op in branch.ops {
            op.action.on_rollback();
        }
        Ok(())
    }

    /// Discard a branch left in a heuristic state.
    pub fn forget(&self, xid: &Xid) -> Result<(), DtxError> {
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(xid)
            .ok_or_else(|| DtxError::UnknownBranch(xid.clone()))?;
        if !branch.state.is_heuristic() {
            return Err(DtxError::IncorrectState {
                xid: xid.clone(),
                state: branch.state,
                operation: "forget",
            });
        }
        branches.remove(xid);
        Ok(())
    }

    /// Prepared branches awaiting a coordinator decision.
    pub fn recover(&self) -> Vec<Xid> {
        self.branches
            .lock()
            .iter()
            .filter(|(_, branch)| branch.state == BranchState::Prepared)
            .map(|(xid, _)| xid.clone())
            .collect()
    }

    /// Branch timeout; zero when none is set.
    pub fn get_timeout(&self, xid: &Xid) -> Result<Duration, DtxError> {
        let branches = self.branches.lock();
        let branch = branches
            .get(xid)
            .ok_or_else(|| DtxError::UnknownBranch(xid.clone()))?;
        Ok(branch.timeout.unwrap_or(Duration::ZERO))
    }

    /// Set the branch timeout, capped at the registry maximum. Zero clears
    /// the timeout.
    pub fn set_timeout(&self, xid: &Xid, timeout: Duration) -> Result<(), DtxError> {
        let now = self.clock.now();
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(xid)
            .ok_or_else(|| DtxError::UnknownBranch(xid.clone()))?;
        if timeout.is_zero() {
            branch.timeout = None;
            branch.expires_at = None;
        } else {
            let capped = match self.max_timeout {
                Some(max) => timeout.min(max),
                None => timeout,
            };
            branch.timeout = Some(capped);
            branch.expires_at = Some(now + capped);
        }
        Ok(())
    }

    /// Drop every association the session holds; branches it was actively
    /// working in become rollback-only. Called when a session closes while
    /// a distributed transaction is selected.
    pub fn end_associations(&self, session: Uuid) {
        let mut branches = self.branches.lock();
        for branch in branches.values_mut() {
            if branch.associations.remove(&session) {
                branch.state = BranchState::RollbackOnly;
            }
            branch.suspended.remove(&session);
        }
    }

    fn add_op(&self, session: Uuid, xid: &Xid, op: PendingOp) -> Result<(), DtxError> {
        let now = self.clock.now();
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(xid)
            .ok_or_else(|| DtxError::UnknownBranch(xid.clone()))?;
        if !branch.associations.contains(&session) {
            return Err(DtxError::NotAssociated(xid.clone()));
        }
        if branch.observe_expiry(xid, now) {
            return Err(DtxError::Timeout(xid.clone()));
        }
        if branch.state != BranchState::Active {
            return Err(DtxError::IncorrectState {
                xid: xid.clone(),
                state: branch.state,
                operation: "transaction work",
            });
        }
        branch.ops.push(op);
        branch.updated_at = now;
        Ok(())
    }

    fn branch_has_ops(&self, xid: &Xid) -> bool {
        self.branches
            .lock()
            .get(xid)
            .map(|branch| !branch.ops.is_empty())
            .unwrap_or(false)
    }

    fn branch_times(&self, xid: &Xid) -> Option<(Instant, Instant)> {
        self.branches
            .lock()
            .get(xid)
            .map(|branch| (branch.started_at, branch.updated_at))
    }

    /// Current state of a branch, if known.
    pub fn branch_state(&self, xid: &Xid) -> Option<BranchState> {
        self.branches.lock().get(xid).map(|branch| branch.state)
    }
}

/// A session's binding to the dtx registry.
///
/// At most one branch is active on a session at a time; starting another
/// without suspending the current one is rejected.
pub struct DistributedTransaction {
    registry: Arc<DtxRegistry>,
    session: Uuid,
    active: Option<Xid>,
}

impl DistributedTransaction {
    pub fn new(registry: Arc<DtxRegistry>, session: Uuid) -> Self {
        Self {
            registry,
            session,
            active: None,
        }
    }

    pub fn start(&mut self, xid: Xid, join: bool, resume: bool) -> Result<(), DtxError> {
        if let Some(active) = &self.active {
            if *active != xid {
                return Err(DtxError::BranchActive(active.clone()));
            }
        }
        self.registry.start(self.session, &xid, join, resume)?;
        self.active = Some(xid);
        Ok(())
    }

    pub fn end(&mut self, xid: &Xid, fail: bool, suspend: bool) -> Result<(), DtxError> {
        let result = self.registry.end(self.session, xid, fail, suspend);
        match &result {
            Ok(()) | Err(DtxError::Timeout(_)) => {
                if self.active.as_ref() == Some(xid) {
                    self.active = None;
                }
            }
            Err(_) => {}
        }
        result
    }

    pub fn active_branch(&self) -> Option<&Xid> {
        self.active.as_ref()
    }

    pub fn registry(&self) -> &Arc<DtxRegistry> {
        &self.registry
    }
}

impl Transaction for DistributedTransaction {
    fn kind(&self) -> TxnKind {
        TxnKind::Distributed
    }

    fn enqueue(
        &mut self,
        queue: &str,
        message: &Arc<dyn MessageHandle>,
        action: TxnAction,
    ) -> Result<(), TxnError> {
        let xid = self.active.clone().ok_or(DtxError::NoActiveBranch)?;
        self.registry
            .add_op(
                self.session,
                &xid,
                PendingOp {
                    store_op: Some(StoreOp::Enqueue {
                        queue: queue.to_string(),
                        message_id: message.message_id(),
                    }),
                    action,
                },
            )
            .map_err(TxnError::from)
    }

    fn dequeue(&mut self, record: EnqueueRecord, action: TxnAction) -> Result<(), TxnError> {
        let xid = self.active.clone().ok_or(DtxError::NoActiveBranch)?;
        self.registry
            .add_op(
                self.session,
                &xid,
                PendingOp {
                    store_op: Some(StoreOp::Dequeue {
                        queue: record.queue,
                        message_id: record.message_id,
                    }),
                    action,
                },
            )
            .map_err(TxnError::from)
    }

    fn commit(&mut self) -> Result<(), TxnError> {
        Err(TxnError::DistributedSelected)
    }

    fn rollback(&mut self) -> Result<(), TxnError> {
        Err(TxnError::DistributedSelected)
    }

    fn has_pending_work(&self) -> bool {
        self.active
            .as_ref()
            .map(|xid| self.registry.branch_has_ops(xid))
            .unwrap_or(false)
    }

    fn start_time(&self) -> Option<Instant> {
        self.active
            .as_ref()
            .and_then(|xid| self.registry.branch_times(xid))
            .map(|(started, _)| started)
    }

    fn update_time(&self) -> Option<Instant> {
        self.active
            .as_ref()
            .and_then(|xid| self.registry.branch_times(xid))
            .map(|(_, updated)| updated)
    }

    fn as_distributed_mut(&mut self) -> Option<&mut DistributedTransaction> {
        Some(self)
    }
}
