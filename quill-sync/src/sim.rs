//! Deterministic in-process simulation of many replicas sharing one document.
//!
//! Every replica has two FIFO queues: updates waiting to reach the registry
//! and registry messages waiting to reach the replica. Each [`step`] picks one
//! non-empty queue at random and delivers its head, so any interleaving the
//! network could produce is reachable while per-connection order is kept.
//!
//! [`step`]: Simulation::step

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::engine::OperationEngine;
use crate::error::SyncError;
use crate::protocol::{ClientUpdate, ConnectionId};
use crate::registry::{Outbound, RoomRegistry};
use crate::replica::ReplicaSession;
use crate::workload::{adjust, check_convergence, ConvergenceReport, Scheduler, WorkloadConfig};

struct SimReplica<E: OperationEngine> {
    conn: ConnectionId,
    session: ReplicaSession<E>,
    inbox: mpsc::UnboundedReceiver<Outbound<E::Op>>,
    downloads: VecDeque<Outbound<E::Op>>,
    uploads: VecDeque<ClientUpdate<E::Op>>,
}

impl<E: OperationEngine> SimReplica<E> {
    fn pull(&mut self) {
        while let Ok(msg) = self.inbox.try_recv() {
            self.downloads.push_back(msg);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Queue {
    Upload(usize),
    Download(usize),
}

pub struct Simulation<E: OperationEngine> {
    doc_id: String,
    registry: RoomRegistry<E>,
    replicas: Vec<SimReplica<E>>,
    scheduler: Scheduler,
    rng: StdRng,
}

impl<E: OperationEngine> Simulation<E> {
    pub fn new(engine: E, config: &WorkloadConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut registry = RoomRegistry::new(engine.clone());
        let replicas = (0..config.replicas)
            .map(|_| {
                let conn = Uuid::new_v4();
                let (tx, inbox) = mpsc::unbounded_channel();
                registry.connect(conn, tx);
                registry.join(conn, &config.doc_id);
                SimReplica {
                    conn,
                    session: ReplicaSession::new(engine.clone()),
                    inbox,
                    downloads: VecDeque::new(),
                    uploads: VecDeque::new(),
                }
            })
            .collect();

        let mut scheduler = Scheduler::new();
        scheduler.start();
        Self {
            doc_id: config.doc_id.clone(),
            registry,
            replicas,
            scheduler,
            rng,
        }
    }

    /// Resume edit generation. A new simulation starts out running.
    pub fn start(&mut self) {
        self.scheduler.start();
    }

    /// Pause edit generation. Queued traffic still flows through [`step`].
    ///
    /// [`step`]: Simulation::step
    pub fn stop(&mut self) {
        self.scheduler.stop();
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// While running, every replica makes one random word edit.
    /// Returns whether edits were generated.
    pub fn tick(&mut self) -> Result<bool, SyncError> {
        if !self.scheduler.tick() {
            return Ok(false);
        }
        for replica in &mut self.replicas {
            let next = adjust(replica.session.state(), &mut self.rng);
            if let Some(update) = replica.session.handle_text(&next)? {
                replica.uploads.push_back(update);
            }
        }
        Ok(true)
    }

    /// Deliver one queued message. Returns `false` when nothing is queued.
    pub fn step(&mut self) -> Result<bool, SyncError> {
        let mut ready = Vec::new();
        for (i, replica) in self.replicas.iter_mut().enumerate() {
            replica.pull();
            if !replica.uploads.is_empty() {
                ready.push(Queue::Upload(i));
            }
            if !replica.downloads.is_empty() {
                ready.push(Queue::Download(i));
            }
        }
        if ready.is_empty() {
            return Ok(false);
        }

        match ready[self.rng.gen_range(0..ready.len())] {
            Queue::Upload(i) => {
                if let Some(update) = self.replicas[i].uploads.pop_front() {
                    self.registry.submit_update(&self.doc_id, update)?;
                }
            }
            Queue::Download(i) => {
                let replica = &mut self.replicas[i];
                match replica.downloads.pop_front() {
                    Some(Outbound::ServerUpdate { broadcast, .. }) => {
                        if let Some(update) = replica.session.handle_broadcast(broadcast)? {
                            replica.uploads.push_back(update);
                        }
                    }
                    Some(Outbound::Snapshot(snapshot)) => {
                        replica.session.resync(snapshot.state, snapshot.revision);
                    }
                    None => {}
                }
            }
        }
        Ok(true)
    }

    /// Deliver everything in flight, including follow-up updates.
    pub fn deliver_all(&mut self) -> Result<usize, SyncError> {
        let mut delivered = 0;
        while self.step()? {
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Interleave `ticks` rounds of edits with random partial delivery, then
    /// let the network go quiet and report. A stopped simulation only
    /// delivers.
    pub fn run(&mut self, ticks: u64) -> Result<ConvergenceReport, SyncError> {
        for _ in 0..ticks {
            self.tick()?;
            let steps = self.rng.gen_range(0..=self.replicas.len() * 2);
            for _ in 0..steps {
                if !self.step()? {
                    break;
                }
            }
        }
        self.deliver_all()?;
        Ok(self.check())
    }

    /// Request a full snapshot for one replica.
    pub fn resync(&mut self, replica: usize) {
        if let Some(r) = self.replicas.get(replica) {
            self.registry.resync(r.conn, &self.doc_id);
        }
    }

    pub fn states(&self) -> Vec<String> {
        self.replicas
            .iter()
            .map(|r| r.session.state().to_string())
            .collect()
    }

    pub fn check(&self) -> ConvergenceReport {
        check_convergence(&self.states())
    }

    pub fn authority_state(&self) -> &str {
        self.registry
            .authority(&self.doc_id)
            .map(|a| a.state())
            .unwrap_or_default()
    }

    pub fn registry(&self) -> &RoomRegistry<E> {
        &self.registry
    }

    pub fn replica(&self, index: usize) -> Option<&ReplicaSession<E>> {
        self.replicas.get(index).map(|r| &r.session)
    }

    pub fn replica_mut(&mut self, index: usize) -> Option<&mut ReplicaSession<E>> {
        self.replicas.get_mut(index).map(|r| &mut r.session)
    }

    /// Queue an update as if replica `index` had sent it.
    pub fn enqueue(&mut self, index: usize, update: ClientUpdate<E::Op>) {
        if let Some(r) = self.replicas.get_mut(index) {
            r.uploads.push_back(update);
        }
    }

    pub fn ticks(&self) -> u64 {
        self.scheduler.ticks()
    }
}
