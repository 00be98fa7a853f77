//! The group coordinator task.
//!
//! All mutable state for one group lives on a single long-lived thread;
//! readers, the background updater and the commit timer talk to it through
//! its mailbox, so every state transition is serialized. Readers asking for
//! a sequence the group has not reached are parked as waiters until an
//! updater pass catches up, and are never blocked by one another.
//!
//! Header commits are deliberately delayed and gated: the header is only
//! written once the database reports the indexed sequence as durable, so a
//! database-side rollback of uncommitted writes can never leave the index
//! describing documents the database no longer has.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};
use std::thread;

use crate::config::GroupConfig;
use crate::errors::{SpatialError, SpatialResult};
use crate::group::{updater, Group, GroupSnapshot};
use crate::source::{SourceDatabase, SpatialEval};
use crate::vtree::cache::NodeCache;
use crate::vtree::file::IndexFile;

enum GroupMsg {
    Request {
        seq: u64,
        reply: Sender<SpatialResult<GroupSnapshot>>,
    },
    PartialUpdate(Group),
    UpdaterFinished(Group),
    UpdaterFailed(String),
    CommitTick,
    DbClosed,
}

/// Handle to a running group task. Cheap to clone; all clones address the
/// same task.
#[derive(Clone)]
pub struct GroupCoordinator {
    tx: Sender<GroupMsg>,
    alive: Arc<AtomicBool>,
}

impl GroupCoordinator {
    /// Starts the group task over an opened index file.
    pub fn spawn(
        file: IndexFile,
        group: Group,
        db: Arc<dyn SourceDatabase>,
        eval: Arc<dyn SpatialEval>,
        config: GroupConfig,
    ) -> GroupCoordinator {
        let (tx, rx) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));

        let cache = NodeCache::new(config.cache_nodes);
        let task = GroupTask {
            file,
            cache,
            group,
            db,
            eval,
            config,
            tx: tx.clone(),
            timer: timer::Timer::new(),
            commit_guard: None,
            waiting_commit: false,
            updater_running: false,
            waiters: Vec::new(),
        };
        let alive_flag = alive.clone();
        thread::spawn(move || {
            task.run(rx);
            alive_flag.store(false, Ordering::SeqCst);
        });

        GroupCoordinator { tx, alive }
    }

    /// Asks for a snapshot at least as fresh as `seq`, blocking until the
    /// group reaches it or fails.
    pub fn request_group(&self, seq: u64) -> SpatialResult<GroupSnapshot> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(GroupMsg::Request {
                seq,
                reply: reply_tx,
            })
            .map_err(|_| SpatialError::GroupShutdown)?;
        match reply_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(SpatialError::GroupShutdown),
        }
    }

    /// Signals that the database went away; the task replies shutdown to
    /// pending waiters and exits.
    pub fn notify_db_closed(&self) {
        let _ = self.tx.send(GroupMsg::DbClosed);
    }

    /// False once the task has terminated, normally or from an updater
    /// failure.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct GroupTask {
    file: IndexFile,
    cache: NodeCache,
    group: Group,
    db: Arc<dyn SourceDatabase>,
    eval: Arc<dyn SpatialEval>,
    config: GroupConfig,
    tx: Sender<GroupMsg>,
    timer: timer::Timer,
    commit_guard: Option<timer::Guard>,
    waiting_commit: bool,
    updater_running: bool,
    waiters: Vec<(u64, Sender<SpatialResult<GroupSnapshot>>)>,
}

impl GroupTask {
    fn run(mut self, rx: Receiver<GroupMsg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                GroupMsg::Request { seq, reply } => self.handle_request(seq, reply),
                GroupMsg::PartialUpdate(group) => {
                    self.group = group;
                    self.schedule_commit();
                }
                GroupMsg::UpdaterFinished(group) => self.handle_updater_finished(group),
                GroupMsg::UpdaterFailed(reason) => {
                    self.handle_updater_failed(reason);
                    return;
                }
                GroupMsg::CommitTick => self.handle_commit_tick(),
                GroupMsg::DbClosed => {
                    self.handle_db_closed();
                    return;
                }
            }
        }
    }

    fn handle_request(&mut self, seq: u64, reply: Sender<SpatialResult<GroupSnapshot>>) {
        let db_seq = self.db.update_seq();
        if seq > db_seq {
            let _ = reply.send(Err(SpatialError::InvalidTargetSeq {
                requested: seq,
                current: db_seq,
            }));
        } else if seq <= self.group.current_seq {
            let _ = reply.send(Ok(self.snapshot()));
        } else {
            self.waiters.push((seq, reply));
            self.ensure_updater();
        }
    }

    /// The file handle is cloned here, before the snapshot leaves the task,
    /// so the reader's reference is in place before anyone can observe the
    /// reply.
    fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot::new(
            self.group.clone(),
            self.file.clone(),
            self.cache.clone(),
            self.config.tree,
        )
    }

    fn ensure_updater(&mut self) {
        if self.updater_running {
            return;
        }
        self.updater_running = true;

        let file = self.file.clone();
        let cache = self.cache.clone();
        let db = self.db.clone();
        let eval = self.eval.clone();
        let config = self.config.clone();
        let group = self.group.clone();
        let tx = self.tx.clone();
        let progress_tx = self.tx.clone();
        thread::spawn(move || {
            let result = updater::run(
                &file,
                &cache,
                db.as_ref(),
                eval.as_ref(),
                &config,
                group,
                |partial| {
                    let _ = progress_tx.send(GroupMsg::PartialUpdate(partial));
                },
            );
            let _ = match result {
                Ok(group) => tx.send(GroupMsg::UpdaterFinished(group)),
                Err(e) => tx.send(GroupMsg::UpdaterFailed(e.to_string())),
            };
        });
    }

    fn handle_updater_finished(&mut self, group: Group) {
        self.group = group;
        self.updater_running = false;

        let current = self.group.current_seq;
        let waiters = std::mem::take(&mut self.waiters);
        for (seq, reply) in waiters {
            if seq <= current {
                let _ = reply.send(Ok(self.snapshot()));
            } else {
                self.waiters.push((seq, reply));
            }
        }

        // Writes that landed after the updater snapshotted its change feed
        // leave waiters unsatisfied: go around again.
        if !self.waiters.is_empty() {
            self.ensure_updater();
        }
    }

    fn handle_updater_failed(&mut self, reason: String) {
        log::error!("spatial group updater failed: {}", reason);
        for (_, reply) in self.waiters.drain(..) {
            let _ = reply.send(Err(SpatialError::UpdaterFailed(reason.clone())));
        }
    }

    fn handle_db_closed(&mut self) {
        log::debug!(
            "spatial group {:?} shutting down",
            self.group.def.design_id
        );
        for (_, reply) in self.waiters.drain(..) {
            let _ = reply.send(Err(SpatialError::GroupShutdown));
        }
    }

    fn schedule_commit(&mut self) {
        if self.waiting_commit {
            return;
        }
        self.waiting_commit = true;
        self.arm_commit_timer();
    }

    fn arm_commit_timer(&mut self) {
        match chrono::Duration::from_std(self.config.commit_delay) {
            Ok(delay) => {
                let tx = self.tx.clone();
                self.commit_guard = Some(self.timer.schedule_with_delay(delay, move || {
                    let _ = tx.send(GroupMsg::CommitTick);
                }));
            }
            Err(e) => {
                log::error!("commit delay out of range, skipping commit timer: {}", e);
            }
        }
    }

    fn handle_commit_tick(&mut self) {
        if !self.waiting_commit {
            return;
        }
        let committed = self.db.committed_seq();
        if committed < self.group.current_seq {
            // The database has not made our sequence durable; committing the
            // header now could outlive a database rollback. Try again later.
            self.arm_commit_timer();
            return;
        }
        match self.file.commit_header(&self.group.to_header()) {
            Ok(()) => {
                log::debug!("committed index header at seq {}", self.group.current_seq);
                self.waiting_commit = false;
                self.commit_guard = None;
            }
            Err(e) => {
                log::error!("index header commit failed: {}", e);
                self.arm_commit_timer();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::Mbr;
    use crate::config::TreeConfig;
    use crate::group::definition::{DesignDoc, GroupDef};
    use crate::source::{Document, FnEval, MemoryDatabase};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};

    fn design() -> DesignDoc {
        DesignDoc {
            id: "_design/geo".into(),
            language: "javascript".into(),
            indices: [("boxes".to_string(), "emit_boxes".to_string())]
                .into_iter()
                .collect(),
            options: BTreeMap::new(),
        }
    }

    fn bbox_eval() -> Arc<dyn SpatialEval> {
        Arc::new(FnEval(|_: &str, doc: &Document| {
            let mut emissions = Vec::new();
            if let Some(boxes) = doc.body.get("boxes").and_then(|b| b.as_array()) {
                for coords in boxes {
                    let coords = coords.as_array().unwrap_or(&Vec::new()).clone();
                    let edge = |i: usize| coords.get(i).and_then(|v| v.as_f64()).unwrap_or(0.0);
                    emissions.push((
                        Mbr::new(edge(0), edge(1), edge(2), edge(3)),
                        doc.id.clone().into_bytes(),
                    ));
                }
            }
            Ok(emissions)
        }))
    }

    fn doc_box(i: u64) -> serde_json::Value {
        let w = i as f64 * 3.0;
        json!({ "boxes": [[w, 0.0, w + 1.0, 1.0]] })
    }

    struct Fixture {
        _dir: TempDir,
        file: IndexFile,
        db: MemoryDatabase,
        coordinator: GroupCoordinator,
    }

    fn spawn_group(eval: Arc<dyn SpatialEval>, config: GroupConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let db = MemoryDatabase::new("places");
        let def = Arc::new(GroupDef::from_design(db.name(), &design()).unwrap());
        let path = def.file_path(dir.path());
        let (file, header) =
            IndexFile::open_or_create(&path, def.signature, def.indices.len()).unwrap();
        let group = Group::from_header(def, &header);
        let coordinator = GroupCoordinator::spawn(
            file.clone(),
            group,
            Arc::new(db.clone()),
            eval,
            config,
        );
        Fixture {
            _dir: dir,
            file,
            db,
            coordinator,
        }
    }

    fn test_config() -> GroupConfig {
        GroupConfig {
            tree: TreeConfig::new(2, 4).unwrap(),
            commit_delay: Duration::from_millis(30),
            checkpoint_docs: 2,
            ..GroupConfig::default()
        }
    }

    fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_request_at_reached_seq_replies_immediately() {
        let fx = spawn_group(bbox_eval(), test_config());
        let snapshot = fx.coordinator.request_group(0).unwrap();
        assert_eq!(snapshot.current_seq(), 0);
        assert!(snapshot
            .query_by_name("boxes", &Mbr::new(0.0, 0.0, 1.0, 1.0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_request_beyond_db_seq_is_invalid() {
        let fx = spawn_group(bbox_eval(), test_config());
        match fx.coordinator.request_group(5) {
            Err(SpatialError::InvalidTargetSeq { requested, current }) => {
                assert_eq!(requested, 5);
                assert_eq!(current, 0);
            }
            other => panic!("expected InvalidTargetSeq, got {other:?}"),
        }
    }

    #[test]
    fn test_request_drives_updater_to_target_seq() {
        let fx = spawn_group(bbox_eval(), test_config());
        for i in 0..3 {
            fx.db.put(format!("doc{}", i), doc_box(i));
        }

        let snapshot = fx.coordinator.request_group(3).unwrap();
        assert!(snapshot.current_seq() >= 3);

        let everywhere = Mbr::new(-1e9, -1e9, 1e9, 1e9);
        let hits = snapshot.query_by_name("boxes", &everywhere).unwrap();
        assert_eq!(hits.len(), 3);

        // A second request at the same sequence is served from state.
        let again = fx.coordinator.request_group(3).unwrap();
        assert!(again.current_seq() >= 3);
    }

    #[test]
    fn test_snapshot_holds_a_file_reference() {
        let fx = spawn_group(bbox_eval(), test_config());
        fx.db.put("doc0", doc_box(0));

        let before = fx.file.handle_count();
        let snapshot = fx.coordinator.request_group(1).unwrap();
        assert!(fx.file.handle_count() > before);
        drop(snapshot);
        assert!(wait_until(Duration::from_secs(1), || {
            fx.file.handle_count() == before
        }));
    }

    #[test]
    fn test_waiters_survive_updater_rounds() {
        // An eval runtime that announces each document and then blocks until
        // the test releases it, making updater round boundaries observable.
        let (started_tx, started_rx) = mpsc::channel::<String>();
        let (permit_tx, permit_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let permit_rx = Mutex::new(permit_rx);
        let eval: Arc<dyn SpatialEval> = Arc::new(FnEval(move |_: &str, doc: &Document| {
            let _ = started_tx.lock().send(doc.id.clone());
            let _ = permit_rx.lock().recv();
            Ok(vec![(Mbr::new(0.0, 0.0, 1.0, 1.0), doc.id.clone().into_bytes())])
        }));

        let fx = spawn_group(eval, test_config());
        fx.db.put("first", json!({"any": true}));

        // Reader A wants seq 1; the updater starts and blocks inside the
        // first document's eval.
        let coord_a = fx.coordinator.clone();
        let reader_a = thread::spawn(move || coord_a.request_group(1));
        assert_eq!(started_rx.recv().unwrap(), "first");

        // A second write lands while the updater is mid-pass; reader B's
        // target is beyond what this pass will reach.
        fx.db.put("second", json!({"any": true}));
        let coord_b = fx.coordinator.clone();
        let reader_b = thread::spawn(move || coord_b.request_group(2));

        // Release the first pass: A is satisfied at seq 1, B is not, and
        // the coordinator respawns the updater for the remainder.
        permit_tx.send(()).unwrap();
        let a = reader_a.join().unwrap().unwrap();
        assert!(a.current_seq() >= 1);

        assert_eq!(started_rx.recv().unwrap(), "second");
        permit_tx.send(()).unwrap();
        let b = reader_b.join().unwrap().unwrap();
        assert!(b.current_seq() >= 2);
    }

    #[test]
    fn test_header_commit_waits_for_db_durability() {
        let fx = spawn_group(bbox_eval(), test_config());
        fx.db.put("doc0", doc_box(0));

        // The group reaches seq 1, but the database has not committed it.
        let snapshot = fx.coordinator.request_group(1).unwrap();
        assert_eq!(snapshot.current_seq(), 1);

        // Give the delayed commit several chances to (wrongly) fire.
        thread::sleep(Duration::from_millis(200));
        let (header, _) = fx.file.read_header().unwrap();
        assert_eq!(header.current_seq, 0, "header committed ahead of the db");

        // Once the database is durable, the re-armed timer commits.
        fx.db.commit_all();
        assert!(wait_until(Duration::from_secs(2), || {
            fx.file.read_header().unwrap().0.current_seq == 1
        }));
    }

    #[test]
    fn test_db_close_shuts_the_group_down() {
        let fx = spawn_group(bbox_eval(), test_config());
        fx.coordinator.notify_db_closed();
        assert!(wait_until(Duration::from_secs(1), || {
            !fx.coordinator.is_alive()
        }));
        match fx.coordinator.request_group(0) {
            Err(SpatialError::GroupShutdown) => {}
            other => panic!("expected GroupShutdown, got {other:?}"),
        }
    }

    #[test]
    fn test_updater_failure_reaches_waiters_and_kills_group() {
        let eval: Arc<dyn SpatialEval> = Arc::new(FnEval(|_: &str, _: &Document| {
            Err(SpatialError::Eval("function threw".into()))
        }));
        let fx = spawn_group(eval, test_config());
        fx.db.put("doc0", doc_box(0));

        match fx.coordinator.request_group(1) {
            Err(SpatialError::UpdaterFailed(reason)) => {
                assert!(reason.contains("function threw"));
            }
            other => panic!("expected UpdaterFailed, got {other:?}"),
        }
        assert!(wait_until(Duration::from_secs(1), || {
            !fx.coordinator.is_alive()
        }));
    }
}
