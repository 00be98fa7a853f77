//! The background updater: walks database changes and advances the trees.
//!
//! One updater runs per group at a time. It reads the change stream from
//! the group's current sequence, evaluates the spatial functions, removes
//! each changed document's prior entries and inserts the new ones, and
//! reports progress back to the coordinator every few hundred documents so
//! readers waiting on intermediate sequences are not held to the end of a
//! long catch-up.

use crate::bounding_box::Mbr;
use crate::config::GroupConfig;
use crate::errors::SpatialResult;
use crate::group::id_map::{entry_key, EmissionRecord, IdMap};
use crate::group::Group;
use crate::source::{SourceDatabase, SpatialEval};
use crate::vtree::cache::NodeCache;
use crate::vtree::file::IndexFile;
use crate::vtree::node::LeafEntry;
use crate::vtree::tree::Vtree;

/// Runs one updater pass, returning the group at the sequence the change
/// stream reached. `progress` receives a checkpointed group every
/// `checkpoint_docs` documents and once at the end.
pub fn run(
    file: &IndexFile,
    cache: &NodeCache,
    db: &dyn SourceDatabase,
    eval: &dyn SpatialEval,
    config: &GroupConfig,
    mut group: Group,
    mut progress: impl FnMut(Group),
) -> SpatialResult<Group> {
    let n_indices = group.def.indices.len();

    // A purge invalidates the removal records: entries for purged documents
    // would linger with no tombstone to evict them. Start the index over.
    let db_purge_seq = db.purge_seq();
    if db_purge_seq > group.purge_seq {
        log::warn!(
            "database purge_seq {} passed index purge_seq {}, rebuilding index",
            db_purge_seq,
            group.purge_seq
        );
        let header = file.reset(group.def.signature, n_indices)?;
        cache.clear();
        group = Group::from_header(group.def.clone(), &header);
        group.purge_seq = db_purge_seq;
    }

    let changes = db.changes_since(group.current_seq)?;
    if changes.is_empty() {
        return Ok(group);
    }
    log::debug!(
        "updater for {:?} processing {} changes from seq {}",
        group.def.design_id,
        changes.len(),
        group.current_seq
    );

    let tree = Vtree::new(file, cache, config.tree);
    let mut id_map = IdMap::load(file, group.id_map_root)?;
    let mut processed = 0usize;

    for change in changes {
        let doc = &change.doc;

        let mut removes: Vec<Vec<(Vec<u8>, Mbr)>> = vec![Vec::new(); n_indices];
        for record in id_map.take(&doc.id) {
            removes[record.index_id].push((entry_key(&doc.id, record.ordinal), record.mbr));
        }

        let mut adds: Vec<Vec<LeafEntry>> = vec![Vec::new(); n_indices];
        let mut records = Vec::new();
        if !doc.deleted {
            for def in &group.def.indices {
                let emissions = eval.map(&def.body, doc)?;
                for (ordinal, (mbr, value)) in emissions.into_iter().enumerate() {
                    let ordinal = ordinal as u32;
                    adds[def.id_num].push(LeafEntry::new(mbr, entry_key(&doc.id, ordinal), value));
                    records.push(EmissionRecord {
                        index_id: def.id_num,
                        ordinal,
                        mbr,
                    });
                }
            }
        }

        for index_id in 0..n_indices {
            if adds[index_id].is_empty() && removes[index_id].is_empty() {
                continue;
            }
            group.roots[index_id] =
                tree.add_remove(group.roots[index_id], &adds[index_id], &removes[index_id])?;
        }
        if !records.is_empty() {
            id_map.put(doc.id.clone(), records);
        }
        group.current_seq = change.seq;

        processed += 1;
        if processed % config.checkpoint_docs == 0 {
            group.id_map_root = Some(id_map.save(file)?);
            progress(group.clone());
        }
    }

    group.id_map_root = Some(id_map.save(file)?);
    progress(group.clone());
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::Mbr;
    use crate::config::TreeConfig;
    use crate::errors::SpatialError;
    use crate::group::definition::{DesignDoc, GroupDef};
    use crate::source::{Document, FnEval, MemoryDatabase};
    use crate::vtree::file::IndexFile;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    /// Evaluates a document body of the form {"boxes": [[w,s,e,n], ...]}.
    fn bbox_eval() -> FnEval<impl Fn(&str, &Document) -> SpatialResult<Vec<(Mbr, Vec<u8>)>>> {
        FnEval(|_body: &str, doc: &Document| {
            let mut emissions = Vec::new();
            if let Some(boxes) = doc.body.get("boxes").and_then(|b| b.as_array()) {
                for coords in boxes {
                    let coords = coords.as_array().ok_or_else(|| {
                        SpatialError::Eval("box must be an array".into())
                    })?;
                    let edge = |i: usize| coords[i].as_f64().unwrap_or(0.0);
                    emissions.push((
                        Mbr::new(edge(0), edge(1), edge(2), edge(3)),
                        doc.id.clone().into_bytes(),
                    ));
                }
            }
            Ok(emissions)
        })
    }

    struct Fixture {
        _dir: TempDir,
        file: IndexFile,
        cache: NodeCache,
        config: GroupConfig,
        group: Group,
        db: MemoryDatabase,
    }

    fn fixture() -> Fixture {
        let design = DesignDoc {
            id: "_design/geo".into(),
            language: "javascript".into(),
            indices: [("boxes".to_string(), "emit_boxes".to_string())]
                .into_iter()
                .collect(),
            options: BTreeMap::new(),
        };
        let def = Arc::new(GroupDef::from_design("places", &design).unwrap());

        let dir = tempdir().unwrap();
        let path = def.file_path(dir.path());
        let (file, header) =
            IndexFile::open_or_create(&path, def.signature, def.indices.len()).unwrap();
        let group = Group::from_header(def, &header);
        let config = GroupConfig {
            tree: TreeConfig::new(2, 4).unwrap(),
            checkpoint_docs: 2,
            ..GroupConfig::default()
        };

        Fixture {
            _dir: dir,
            file,
            cache: NodeCache::new(128),
            config,
            group,
            db: MemoryDatabase::new("places"),
        }
    }

    fn doc_box(i: u64) -> serde_json::Value {
        let w = i as f64 * 3.0;
        json!({ "boxes": [[w, 0.0, w + 1.0, 1.0]] })
    }

    fn query_all(fx: &Fixture, group: &Group) -> Vec<String> {
        let tree = Vtree::new(&fx.file, &fx.cache, fx.config.tree);
        let everywhere = Mbr::new(-1e9, -1e9, 1e9, 1e9);
        let mut ids: Vec<String> = tree
            .lookup(group.roots[0], &everywhere)
            .unwrap()
            .into_iter()
            .map(|e| String::from_utf8(e.value).unwrap())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_indexes_new_documents() {
        let fx = fixture();
        for i in 0..5 {
            fx.db.put(format!("doc{}", i), doc_box(i));
        }

        let eval = bbox_eval();
        let group = run(
            &fx.file,
            &fx.cache,
            &fx.db,
            &eval,
            &fx.config,
            fx.group.clone(),
            |_| {},
        )
        .unwrap();

        assert_eq!(group.current_seq, 5);
        assert!(group.id_map_root.is_some());
        assert_eq!(
            query_all(&fx, &group),
            vec!["doc0", "doc1", "doc2", "doc3", "doc4"]
        );
    }

    #[test]
    fn test_update_replaces_prior_entries() {
        let fx = fixture();
        fx.db.put("doc0", doc_box(0));
        let eval = bbox_eval();
        let group = run(
            &fx.file, &fx.cache, &fx.db, &eval, &fx.config, fx.group.clone(), |_| {},
        )
        .unwrap();

        // Move the document somewhere else entirely.
        fx.db.put("doc0", json!({ "boxes": [[100.0, 100.0, 101.0, 101.0]] }));
        let group = run(&fx.file, &fx.cache, &fx.db, &eval, &fx.config, group, |_| {}).unwrap();

        let tree = Vtree::new(&fx.file, &fx.cache, fx.config.tree);
        let old_site = tree
            .lookup(group.roots[0], &Mbr::new(-1.0, -1.0, 2.0, 2.0))
            .unwrap();
        assert!(old_site.is_empty());
        let new_site = tree
            .lookup(group.roots[0], &Mbr::new(99.0, 99.0, 102.0, 102.0))
            .unwrap();
        assert_eq!(new_site.len(), 1);
    }

    #[test]
    fn test_deletion_removes_all_emissions() {
        let fx = fixture();
        fx.db.put(
            "multi",
            json!({ "boxes": [[0.0, 0.0, 1.0, 1.0], [10.0, 10.0, 11.0, 11.0]] }),
        );
        fx.db.put("keeper", doc_box(20));

        let eval = bbox_eval();
        let group = run(
            &fx.file, &fx.cache, &fx.db, &eval, &fx.config, fx.group.clone(), |_| {},
        )
        .unwrap();
        assert_eq!(query_all(&fx, &group).len(), 3);

        fx.db.remove("multi");
        let group = run(&fx.file, &fx.cache, &fx.db, &eval, &fx.config, group, |_| {}).unwrap();
        assert_eq!(query_all(&fx, &group), vec!["keeper"]);
    }

    #[test]
    fn test_document_emitting_nothing_is_skipped() {
        let fx = fixture();
        fx.db.put("empty", json!({ "boxes": [] }));
        fx.db.put("real", doc_box(1));

        let eval = bbox_eval();
        let group = run(
            &fx.file, &fx.cache, &fx.db, &eval, &fx.config, fx.group.clone(), |_| {},
        )
        .unwrap();
        assert_eq!(group.current_seq, 2);
        assert_eq!(query_all(&fx, &group), vec!["real"]);
    }

    #[test]
    fn test_checkpoint_cadence() {
        let fx = fixture();
        for i in 0..5 {
            fx.db.put(format!("doc{}", i), doc_box(i));
        }

        let eval = bbox_eval();
        let mut reported = Vec::new();
        run(
            &fx.file,
            &fx.cache,
            &fx.db,
            &eval,
            &fx.config,
            fx.group.clone(),
            |g| reported.push(g.current_seq),
        )
        .unwrap();

        // checkpoint_docs = 2: checkpoints at docs 2 and 4, plus the final.
        assert_eq!(reported, vec![2, 4, 5]);
    }

    #[test]
    fn test_no_changes_is_a_no_op() {
        let fx = fixture();
        let eval = bbox_eval();
        let before_len = fx.file.len();
        let mut calls = 0;
        let group = run(
            &fx.file,
            &fx.cache,
            &fx.db,
            &eval,
            &fx.config,
            fx.group.clone(),
            |_| calls += 1,
        )
        .unwrap();
        assert_eq!(group.current_seq, 0);
        assert_eq!(calls, 0);
        assert_eq!(fx.file.len(), before_len);
    }

    #[test]
    fn test_purge_resets_the_index() {
        let fx = fixture();
        fx.db.put("gone", doc_box(0));
        fx.db.put("stays", doc_box(5));

        let eval = bbox_eval();
        let group = run(
            &fx.file, &fx.cache, &fx.db, &eval, &fx.config, fx.group.clone(), |_| {},
        )
        .unwrap();
        assert_eq!(query_all(&fx, &group).len(), 2);

        fx.db.purge("gone");
        let group = run(&fx.file, &fx.cache, &fx.db, &eval, &fx.config, group, |_| {}).unwrap();

        assert_eq!(group.purge_seq, fx.db.purge_seq());
        assert_eq!(query_all(&fx, &group), vec!["stays"]);
    }

    #[test]
    fn test_eval_failure_propagates() {
        let fx = fixture();
        fx.db.put("doc0", doc_box(0));

        let eval = FnEval(|_: &str, _: &Document| {
            Err(SpatialError::Eval("function threw".into()))
        });
        let result = run(
            &fx.file, &fx.cache, &fx.db, &eval, &fx.config, fx.group.clone(), |_| {},
        );
        assert!(matches!(result, Err(SpatialError::Eval(_))));
    }
}
